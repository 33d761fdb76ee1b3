//! Container cluster and the instance capacity backing it.

use crate::erp::{network, services, CapacityConfig, Error, Network, MOUNT_PATH};
use erp_template::{intrinsic, LogicalId, Parameter, Resource, Stack};
use serde_json::json;
use tracing::info;

/// Public parameter resolving to the current ECS-optimized image
const AMI_PARAMETER: &str = "/aws/service/ecs/optimized-ami/amazon-linux-2023/recommended/image_id";

/// Handles to the declared cluster and its capacity.
#[derive(Clone, Debug)]
pub struct Capacity {
    pub cluster: LogicalId,
    pub security_group: LogicalId,
    pub launch_template: LogicalId,
    pub auto_scaling_group: LogicalId,
    pub provider: LogicalId,
    /// Every service must wait for this before it can be placed
    pub association: LogicalId,
}

impl Capacity {
    /// Declare the cluster and one auto-scaling group of `config.instance_type` instances.
    ///
    /// Each instance mounts its data volume at [MOUNT_PATH] before joining the cluster.
    pub fn build(stack: &mut Stack, config: &CapacityConfig, network: &Network) -> Result<Self, Error> {
        let cluster = stack.add(
            "Cluster",
            Resource::new(
                "AWS::ECS::Cluster",
                json!({
                    "ClusterSettings": [{"Name": "containerInsights", "Value": "enabled"}],
                }),
            ),
        )?;
        let image = stack.add_parameter(
            "AmiId",
            Parameter::of_kind("AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>")
                .with_default(AMI_PARAMETER)
                .with_description("ECS-optimized image of cluster instances"),
        )?;
        let security_group =
            network::security_group(stack, "InstanceSecurityGroup", "ERP cluster instances", network)?;

        let role = stack.add(
            "InstanceRole",
            Resource::new(
                "AWS::IAM::Role",
                json!({
                    "AssumeRolePolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Principal": {"Service": "ec2.amazonaws.com"},
                            "Action": "sts:AssumeRole",
                        }],
                    },
                    "ManagedPolicyArns": [
                        managed_policy("service-role/AmazonEC2ContainerServiceforEC2Role"),
                        managed_policy("AmazonSSMManagedInstanceCore"),
                    ],
                }),
            ),
        )?;
        let profile = stack.add(
            "InstanceProfile",
            Resource::new(
                "AWS::IAM::InstanceProfile",
                json!({ "Roles": [intrinsic::reference(&role)] }),
            ),
        )?;

        let launch_template = stack.add(
            "LaunchTemplate",
            Resource::new(
                "AWS::EC2::LaunchTemplate",
                json!({
                    "LaunchTemplateData": {
                        "ImageId": intrinsic::reference(&image),
                        "InstanceType": config.instance_type,
                        "IamInstanceProfile": {"Arn": intrinsic::get_att(&profile, "Arn")},
                        "SecurityGroupIds": [intrinsic::get_att(&security_group, "GroupId")],
                        "MetadataOptions": {"HttpTokens": "required", "HttpPutResponseHopLimit": 2},
                        "BlockDeviceMappings": [{
                            "DeviceName": config.data_device,
                            "Ebs": {
                                "VolumeSize": config.data_volume_size,
                                "VolumeType": "gp3",
                                "Encrypted": true,
                                "DeleteOnTermination": true,
                            },
                        }],
                        "UserData": services::user_data(
                            intrinsic::reference(&cluster),
                            &config.data_device,
                            MOUNT_PATH,
                        ),
                    },
                }),
            ),
        )?;
        let auto_scaling_group = stack.add(
            "AutoScalingGroup",
            Resource::new(
                "AWS::AutoScaling::AutoScalingGroup",
                json!({
                    "MinSize": config.min.to_string(),
                    "MaxSize": config.max.to_string(),
                    "DesiredCapacity": config.desired.to_string(),
                    "LaunchTemplate": {
                        "LaunchTemplateId": intrinsic::reference(&launch_template),
                        "Version": intrinsic::get_att(&launch_template, "LatestVersionNumber"),
                    },
                    "VPCZoneIdentifier": network.private_subnet_refs(),
                    "NewInstancesProtectedFromScaleIn": false,
                }),
            ),
        )?;
        let provider = stack.add(
            "CapacityProvider",
            Resource::new(
                "AWS::ECS::CapacityProvider",
                json!({
                    "AutoScalingGroupProvider": {
                        "AutoScalingGroupArn": intrinsic::reference(&auto_scaling_group),
                        "ManagedScaling": {"Status": "ENABLED", "TargetCapacity": 100},
                        "ManagedTerminationProtection": "DISABLED",
                    },
                }),
            ),
        )?;
        let association = stack.add(
            "ClusterCapacityProviderAssociation",
            Resource::new(
                "AWS::ECS::ClusterCapacityProviderAssociations",
                json!({
                    "Cluster": intrinsic::reference(&cluster),
                    "CapacityProviders": [intrinsic::reference(&provider)],
                    "DefaultCapacityProviderStrategy": [{
                        "CapacityProvider": intrinsic::reference(&provider),
                        "Weight": 1,
                    }],
                }),
            ),
        )?;

        info!(
            instance_type = config.instance_type.as_str(),
            min = config.min,
            desired = config.desired,
            max = config.max,
            "built capacity"
        );
        Ok(Self {
            cluster,
            security_group,
            launch_template,
            auto_scaling_group,
            provider,
            association,
        })
    }
}

/// ARN of an AWS-managed IAM policy in the deployment partition.
fn managed_policy(name: &str) -> serde_json::Value {
    intrinsic::join(
        "",
        [
            json!("arn:"),
            intrinsic::pseudo(intrinsic::PARTITION),
            json!(format!(":iam::aws:policy/{name}")),
        ],
    )
}
