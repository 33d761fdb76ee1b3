//! Managed in-memory cache shared by every ERP role.

use crate::erp::{network, CacheConfig, Error, Network, Service};
use erp_template::{intrinsic, LogicalId, Output, Resource, Stack};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Handles to the declared cache.
#[derive(Clone, Debug)]
pub struct Cache {
    pub id: LogicalId,
    pub security_group: LogicalId,
    pub subnet_group: LogicalId,
    pub port: u16,
    pub clustered: bool,
}

impl Cache {
    /// Endpoint attribute prefix (cluster mode exposes a configuration endpoint instead).
    fn endpoint(&self) -> &'static str {
        if self.clustered {
            "ConfigurationEndPoint"
        } else {
            "PrimaryEndPoint"
        }
    }

    /// Deploy-time hostname of the cache.
    pub fn host(&self) -> Value {
        intrinsic::get_att(&self.id, &format!("{}.Address", self.endpoint()))
    }

    /// Deploy-time port of the cache.
    pub fn port_value(&self) -> Value {
        intrinsic::get_att(&self.id, &format!("{}.Port", self.endpoint()))
    }

    /// `rediss://<host>:<port>` (transit encryption is always on).
    pub fn connection_string(&self) -> Value {
        intrinsic::join(
            "",
            [
                json!("rediss://"),
                self.host(),
                json!(":"),
                self.port_value(),
            ],
        )
    }

    /// Declare the subnet group, security group, and replication group, and export the endpoint.
    pub fn build(stack: &mut Stack, config: &CacheConfig, network: &Network) -> Result<Self, Error> {
        let subnet_group = stack.add(
            "CacheSubnetGroup",
            Resource::new(
                "AWS::ElastiCache::SubnetGroup",
                json!({
                    "Description": "Private subnets of the ERP cache",
                    "SubnetIds": network.private_subnet_refs(),
                }),
            ),
        )?;
        let security_group =
            network::security_group(stack, "CacheSecurityGroup", "ERP cache", network)?;

        let clustered = config.shards > 1;
        let failover = config.replicas > 0;
        let mut properties = json!({
            "ReplicationGroupDescription": format!("{} cache", stack.name()),
            "Engine": config.engine,
            "CacheNodeType": config.node_type,
            "NumNodeGroups": config.shards,
            "ReplicasPerNodeGroup": config.replicas,
            "Port": config.port,
            "CacheSubnetGroupName": intrinsic::reference(&subnet_group),
            "SecurityGroupIds": [intrinsic::get_att(&security_group, "GroupId")],
            "TransitEncryptionEnabled": true,
            "AtRestEncryptionEnabled": true,
            "AutomaticFailoverEnabled": failover || clustered,
            "MultiAZEnabled": failover,
        });
        if clustered {
            properties["ClusterMode"] = json!("Enabled");
        }
        let id = stack.add(
            "Cache",
            Resource::new("AWS::ElastiCache::ReplicationGroup", properties),
        )?;
        debug!(
            cache = id.as_str(),
            engine = config.engine.as_str(),
            shards = config.shards,
            replicas = config.replicas,
            "declared replication group"
        );

        let cache = Self {
            id,
            security_group,
            subnet_group,
            port: config.port,
            clustered,
        };
        stack.add_output(
            "CacheHost",
            Output::new(cache.host()).with_description("Cache endpoint address"),
        )?;
        stack.add_output(
            "CachePort",
            Output::new(cache.port_value()).with_description("Cache endpoint port"),
        )?;
        info!(
            node_type = config.node_type.as_str(),
            port = config.port,
            "built cache"
        );
        Ok(cache)
    }
}

/// Admit every service to the cache port.
///
/// One ingress rule per service with a security group, sourced from that group only. Services
/// without a security group are skipped.
pub fn wire_cache_ingress(
    stack: &mut Stack,
    cache: &Cache,
    services: &[Service],
) -> Result<Vec<LogicalId>, Error> {
    let mut rules = Vec::new();
    for service in services {
        let Some(source) = &service.security_group else {
            debug!(role = service.role.name(), "skipping cache ingress");
            continue;
        };
        rules.push(network::grant_ingress(
            stack,
            &cache.security_group,
            source,
            cache.port,
        )?);
    }
    info!(rules = rules.len(), "wired cache ingress");
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erp::{NetworkConfig, Role};
    use erp_template::Environment;

    fn setup(config: &CacheConfig) -> (Stack, Cache, Network) {
        let mut stack = Stack::new("Test", Environment::agnostic());
        let network = network::build(&mut stack, &NetworkConfig::default()).unwrap();
        let cache = Cache::build(&mut stack, config, &network).unwrap();
        (stack, cache, network)
    }

    fn service(stack: &mut Stack, network: &Network, role: Role, with_group: bool) -> Service {
        let security_group = with_group.then(|| {
            network::security_group(stack, &format!("{}SecurityGroup", role.name()), "svc", network)
                .unwrap()
        });
        Service {
            role,
            id: LogicalId::new(format!("{}Service", role.name())).unwrap(),
            security_group,
        }
    }

    #[test]
    fn test_replication_group() {
        let (stack, cache, _) = setup(&CacheConfig::default());
        let group = stack.resource(&cache.id).unwrap();
        assert_eq!(group.kind(), "AWS::ElastiCache::ReplicationGroup");
        let properties = group.properties();
        assert_eq!(properties["Engine"], json!("valkey"));
        assert_eq!(properties["CacheNodeType"], json!("cache.t3.micro"));
        assert_eq!(properties["NumNodeGroups"], json!(1));
        assert_eq!(properties["ReplicasPerNodeGroup"], json!(1));
        assert_eq!(properties["TransitEncryptionEnabled"], json!(true));
        assert_eq!(properties["AtRestEncryptionEnabled"], json!(true));
        assert_eq!(properties["AutomaticFailoverEnabled"], json!(true));
        assert!(properties.get("ClusterMode").is_none());

        let subnets = stack.resource(&cache.subnet_group).unwrap();
        assert_eq!(
            subnets.property("SubnetIds"),
            Some(&json!([{"Ref": "PrivateSubnet1"}, {"Ref": "PrivateSubnet2"}]))
        );
    }

    #[test]
    fn test_single_node_has_no_failover() {
        let config = CacheConfig {
            replicas: 0,
            ..CacheConfig::default()
        };
        let (stack, cache, _) = setup(&config);
        let properties = stack.resource(&cache.id).unwrap().properties();
        assert_eq!(properties["AutomaticFailoverEnabled"], json!(false));
        assert_eq!(properties["MultiAZEnabled"], json!(false));
    }

    #[test]
    fn test_endpoint_values_and_outputs() {
        let (stack, cache, _) = setup(&CacheConfig::default());
        assert_eq!(
            cache.connection_string(),
            json!({"Fn::Join": ["", [
                "rediss://",
                {"Fn::GetAtt": ["Cache", "PrimaryEndPoint.Address"]},
                ":",
                {"Fn::GetAtt": ["Cache", "PrimaryEndPoint.Port"]},
            ]]})
        );
        assert_eq!(stack.output("CacheHost").unwrap().value, cache.host());
        assert_eq!(stack.output("CachePort").unwrap().value, cache.port_value());
    }

    #[test]
    fn test_clustered_cache_uses_configuration_endpoint() {
        let config = CacheConfig {
            shards: 3,
            ..CacheConfig::default()
        };
        let (stack, cache, _) = setup(&config);
        assert_eq!(
            cache.host(),
            json!({"Fn::GetAtt": ["Cache", "ConfigurationEndPoint.Address"]})
        );
        let properties = stack.resource(&cache.id).unwrap().properties();
        assert_eq!(properties["ClusterMode"], json!("Enabled"));
    }

    #[test]
    fn test_wire_cache_ingress_skips_services_without_groups() {
        let (mut stack, cache, network) = setup(&CacheConfig::default());
        let services = vec![
            service(&mut stack, &network, Role::Backend, true),
            service(&mut stack, &network, Role::Scheduler, false),
            service(&mut stack, &network, Role::ShortQueue, true),
        ];
        let rules = wire_cache_ingress(&mut stack, &cache, &services).unwrap();
        assert_eq!(rules.len(), 2);
        for (rule, source) in rules.iter().zip(["BackendSecurityGroup", "ShortQueueSecurityGroup"]) {
            let properties = stack.resource(rule).unwrap().properties();
            assert_eq!(
                properties["SourceSecurityGroupId"],
                json!({"Fn::GetAtt": [source, "GroupId"]})
            );
            assert_eq!(properties["FromPort"], json!(6379));
            assert_eq!(properties["ToPort"], json!(6379));
        }
    }

    #[test]
    fn test_wire_cache_ingress_without_services() {
        let (mut stack, cache, _) = setup(&CacheConfig::default());
        assert!(wire_cache_ingress(&mut stack, &cache, &[]).unwrap().is_empty());
    }
}
