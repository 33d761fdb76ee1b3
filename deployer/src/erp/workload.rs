//! Roles, their task definitions, and the services that keep them running.

use crate::erp::{
    network, services, Capacity, Config, Error, Network, BACKEND_PORT, DATABASE_PATH,
    FRONTEND_PORT, MOUNT_PATH, SITES_PATH,
};
use erp_template::{intrinsic, LogicalId, Parameter, Resource, Stack};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

/// Name of the data volume in every task definition
const DATA_VOLUME: &str = "data";

/// Days container logs are kept
const LOG_RETENTION_DAYS: u32 = 30;

/// A process of the ERP deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Backend,
    Frontend,
    ShortQueue,
    LongQueue,
    Scheduler,
    Database,
    Configurator,
    SiteCreator,
}

impl Role {
    /// Roles with a long-running task definition.
    pub const LONG_RUNNING: [Role; 6] = [
        Role::Backend,
        Role::Frontend,
        Role::ShortQueue,
        Role::LongQueue,
        Role::Scheduler,
        Role::Database,
    ];

    /// Roles kept running by a service.
    pub const SERVICES: [Role; 5] = [
        Role::Backend,
        Role::Frontend,
        Role::ShortQueue,
        Role::LongQueue,
        Role::Scheduler,
    ];

    /// Roles run once to completion.
    pub const ONE_SHOT: [Role; 2] = [Role::Configurator, Role::SiteCreator];

    /// Prefix of every logical id declared for the role.
    pub fn name(&self) -> &'static str {
        match self {
            Role::Backend => "Backend",
            Role::Frontend => "Frontend",
            Role::ShortQueue => "ShortQueue",
            Role::LongQueue => "LongQueue",
            Role::Scheduler => "Scheduler",
            Role::Database => "Database",
            Role::Configurator => "Configurator",
            Role::SiteCreator => "SiteCreator",
        }
    }

    /// Container name and service-discovery label.
    pub fn dns_name(&self) -> &'static str {
        match self {
            Role::Backend => "backend",
            Role::Frontend => "frontend",
            Role::ShortQueue => "queue-short",
            Role::LongQueue => "queue-long",
            Role::Scheduler => "scheduler",
            Role::Database => "db",
            Role::Configurator => "configurator",
            Role::SiteCreator => "create-site",
        }
    }

    pub fn is_one_shot(&self) -> bool {
        Self::ONE_SHOT.contains(self)
    }

    /// Path the role keeps its state at inside the container.
    pub fn data_path(&self) -> &'static str {
        match self {
            Role::Database => DATABASE_PATH,
            _ => SITES_PATH,
        }
    }
}

/// A host directory mounted into a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
}

impl VolumeMount {
    /// The role's data path, backed by the instance data volume.
    ///
    /// Every role mounts the same host path.
    pub fn data(role: Role) -> Self {
        Self {
            host_path: MOUNT_PATH.to_string(),
            container_path: role.data_path().to_string(),
        }
    }
}

/// Everything needed to declare the task definition of one role.
#[derive(Clone, Debug)]
pub struct Workload {
    pub role: Role,
    pub image: String,
    /// Hard memory limit in MiB
    pub memory: u32,
    pub command: Option<Vec<String>>,
    /// Shell command run by the container health check
    pub health_check: Option<String>,
    pub volume: Option<VolumeMount>,
    pub environment: Vec<(String, Value)>,
    pub port: Option<u16>,
    /// Resources that must exist before the task definition is created
    pub dependencies: Vec<LogicalId>,
}

impl Workload {
    pub fn new(role: Role, image: impl Into<String>, memory: u32) -> Self {
        Self {
            role,
            image: image.into(),
            memory,
            command: None,
            health_check: None,
            volume: None,
            environment: Vec::new(),
            port: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_command<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_health_check(mut self, command: impl Into<String>) -> Self {
        self.health_check = Some(command.into());
        self
    }

    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Set environment variable `name` to `value` (a literal or an intrinsic).
    pub fn with_env(mut self, name: impl Into<String>, value: Value) -> Self {
        self.environment.push((name.into(), value));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Create the task definition only after `id` exists.
    pub fn after(mut self, id: &LogicalId) -> Self {
        self.dependencies.push(id.clone());
        self
    }

    /// The canonical workload of a long-running role.
    pub fn long_running(role: Role, config: &Config, context: &Context) -> Self {
        let memory = config.services.memory(role);
        let erp = Self::new(role, config.image.as_str(), memory).with_volume(VolumeMount::data(role));
        match role {
            Role::Backend => erp
                .with_port(BACKEND_PORT)
                .with_health_check(services::BACKEND_HEALTH_CMD),
            Role::Frontend => erp
                .with_command([services::FRONTEND_ENTRYPOINT])
                .with_port(FRONTEND_PORT)
                .with_health_check(services::FRONTEND_HEALTH_CMD)
                .with_env(
                    "BACKEND",
                    json!(format!("{}:{BACKEND_PORT}", context.hostname(Role::Backend))),
                )
                .with_env("FRAPPE_SITE_NAME_HEADER", json!(config.site.name)),
            Role::ShortQueue => erp
                .with_command(["bench", "worker", "--queue", "short,default"])
                .with_health_check(services::BACKEND_HEALTH_CMD),
            Role::LongQueue => erp
                .with_command(["bench", "worker", "--queue", "long,default,short"])
                .with_health_check(services::BACKEND_HEALTH_CMD),
            Role::Scheduler => erp
                .with_command(["bench", "schedule"])
                .with_health_check(services::BACKEND_HEALTH_CMD),
            Role::Database => {
                Self::new(role, config.database.image.as_str(), memory)
                    .with_volume(VolumeMount::data(role))
                    .with_command([
                        "--character-set-server=utf8mb4",
                        "--collation-server=utf8mb4_unicode_ci",
                        "--skip-character-set-client-handshake",
                        "--skip-innodb-read-only-compressed",
                    ])
                    .with_port(config.database.port)
                    .with_health_check(services::DATABASE_HEALTH_CMD)
                    .with_env(
                        "MYSQL_ROOT_PASSWORD",
                        intrinsic::reference(&context.db_root_password),
                    )
            }
            Role::Configurator | Role::SiteCreator => erp,
        }
    }

    fn container(&self, context: &Context) -> Value {
        let mut container = Map::new();
        container.insert("Name".into(), json!(self.role.dns_name()));
        container.insert("Image".into(), json!(self.image));
        container.insert("Essential".into(), json!(true));
        container.insert("Memory".into(), json!(self.memory));
        if let Some(command) = &self.command {
            container.insert("Command".into(), json!(command));
        }
        if let Some(health_check) = &self.health_check {
            container.insert(
                "HealthCheck".into(),
                json!({
                    "Command": ["CMD-SHELL", health_check],
                    "Interval": 30,
                    "Timeout": 5,
                    "Retries": 3,
                    "StartPeriod": 60,
                }),
            );
        }
        if let Some(volume) = &self.volume {
            container.insert(
                "MountPoints".into(),
                json!([{
                    "SourceVolume": DATA_VOLUME,
                    "ContainerPath": volume.container_path,
                    "ReadOnly": false,
                }]),
            );
        }
        if !self.environment.is_empty() {
            let environment: Vec<Value> = self
                .environment
                .iter()
                .map(|(name, value)| json!({"Name": name, "Value": value}))
                .collect();
            container.insert("Environment".into(), Value::Array(environment));
        }
        if let Some(port) = self.port {
            container.insert(
                "PortMappings".into(),
                json!([{"ContainerPort": port, "Protocol": "tcp"}]),
            );
        }
        container.insert(
            "LogConfiguration".into(),
            json!({
                "LogDriver": "awslogs",
                "Options": {
                    "awslogs-group": intrinsic::reference(&context.log_group),
                    "awslogs-region": intrinsic::pseudo(intrinsic::REGION),
                    "awslogs-stream-prefix": self.role.dns_name(),
                },
            }),
        );
        Value::Object(container)
    }
}

/// A declared task definition.
#[derive(Clone, Debug)]
pub struct TaskDefinition {
    pub role: Role,
    pub id: LogicalId,
}

/// A declared long-running service.
#[derive(Clone, Debug)]
pub struct Service {
    pub role: Role,
    pub id: LogicalId,
    pub security_group: Option<LogicalId>,
}

/// Resources shared by every task definition and service.
#[derive(Clone, Debug)]
pub struct Context {
    pub log_group: LogicalId,
    pub execution_role: LogicalId,
    pub namespace: LogicalId,
    /// Domain of the private namespace (e.g. `erp.local`)
    pub domain: String,
    pub db_root_password: LogicalId,
    pub admin_password: LogicalId,
}

impl Context {
    pub fn build(stack: &mut Stack, config: &Config, network: &Network) -> Result<Self, Error> {
        let db_root_password = stack.add_parameter(
            "DbRootPassword",
            Parameter::string()
                .with_description("Root password of the ERP database")
                .secret(),
        )?;
        let admin_password = stack.add_parameter(
            "AdminPassword",
            Parameter::string()
                .with_description("Administrator password of the ERP site")
                .secret(),
        )?;
        let log_group = stack.add(
            "LogGroup",
            Resource::new(
                "AWS::Logs::LogGroup",
                json!({
                    "LogGroupName": format!("/erp/{}", stack.name()),
                    "RetentionInDays": LOG_RETENTION_DAYS,
                }),
            ),
        )?;
        let execution_role = stack.add(
            "TaskExecutionRole",
            Resource::new(
                "AWS::IAM::Role",
                json!({
                    "AssumeRolePolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Principal": {"Service": "ecs-tasks.amazonaws.com"},
                            "Action": "sts:AssumeRole",
                        }],
                    },
                    "ManagedPolicyArns": [intrinsic::join("", [
                        json!("arn:"),
                        intrinsic::pseudo(intrinsic::PARTITION),
                        json!(":iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy"),
                    ])],
                }),
            ),
        )?;
        let namespace = stack.add(
            "Namespace",
            Resource::new(
                "AWS::ServiceDiscovery::PrivateDnsNamespace",
                json!({
                    "Name": config.services.namespace,
                    "Vpc": network.vpc_ref(),
                }),
            ),
        )?;
        Ok(Self {
            log_group,
            execution_role,
            namespace,
            domain: config.services.namespace.clone(),
            db_root_password,
            admin_password,
        })
    }

    /// Private DNS name `role` is discoverable under.
    pub fn hostname(&self, role: Role) -> String {
        format!("{}.{}", role.dns_name(), self.domain)
    }
}

/// Declare the task definition of `workload`.
///
/// Every task gets its own network interface (`awsvpc`); the data volume, when present, is
/// backed by a directory of the instance data volume.
pub fn declare_task_definition(
    stack: &mut Stack,
    context: &Context,
    workload: &Workload,
) -> Result<TaskDefinition, Error> {
    let role = workload.role;
    let mut properties = json!({
        "Family": format!("{}-{}", stack.name(), role.dns_name()),
        "NetworkMode": "awsvpc",
        "RequiresCompatibilities": ["EC2"],
        "ExecutionRoleArn": intrinsic::get_att(&context.execution_role, "Arn"),
        "ContainerDefinitions": [workload.container(context)],
    });
    if let Some(volume) = &workload.volume {
        properties["Volumes"] = json!([{
            "Name": DATA_VOLUME,
            "Host": {"SourcePath": volume.host_path},
        }]);
    }
    let id = stack.add(
        &format!("{}TaskDefinition", role.name()),
        Resource::new("AWS::ECS::TaskDefinition", properties)
            .depends_on_all(&workload.dependencies),
    )?;
    debug!(role = role.name(), memory = workload.memory, "declared task definition");
    Ok(TaskDefinition { role, id })
}

/// Declare the registry that makes tasks of `role` resolvable as [Context::hostname].
///
/// Tasks appear under the name once they run with the registry attached.
pub fn declare_discovery(
    stack: &mut Stack,
    context: &Context,
    role: Role,
) -> Result<LogicalId, Error> {
    Ok(stack.add(
        &format!("{}DiscoveryService", role.name()),
        Resource::new(
            "AWS::ServiceDiscovery::Service",
            json!({
                "Name": role.dns_name(),
                "NamespaceId": intrinsic::get_att(&context.namespace, "Id"),
                "DnsConfig": {
                    "RoutingPolicy": "MULTIVALUE",
                    "DnsRecords": [{"Type": "A", "TTL": 60}],
                },
                "HealthCheckCustomConfig": {"FailureThreshold": 1},
            }),
        ),
    )?)
}

/// Declare the security group, discovery registration, and service running `task_definition`.
pub fn declare_service(
    stack: &mut Stack,
    context: &Context,
    network: &Network,
    capacity: &Capacity,
    task_definition: &TaskDefinition,
    weight: u32,
) -> Result<Service, Error> {
    let role = task_definition.role;
    let security_group = network::security_group(
        stack,
        &format!("{}SecurityGroup", role.name()),
        &format!("ERP {}", role.dns_name()),
        network,
    )?;
    let discovery = declare_discovery(stack, context, role)?;
    let id = stack.add(
        &format!("{}Service", role.name()),
        Resource::new(
            "AWS::ECS::Service",
            json!({
                "Cluster": intrinsic::reference(&capacity.cluster),
                "TaskDefinition": intrinsic::reference(&task_definition.id),
                "DesiredCount": 1,
                "DeploymentConfiguration": {
                    "MinimumHealthyPercent": 100,
                    "MaximumPercent": 200,
                },
                "CapacityProviderStrategy": [{
                    "CapacityProvider": intrinsic::reference(&capacity.provider),
                    "Weight": weight,
                }],
                "NetworkConfiguration": {
                    "AwsvpcConfiguration": {
                        "AssignPublicIp": "DISABLED",
                        "Subnets": network.private_subnet_refs(),
                        "SecurityGroups": [intrinsic::get_att(&security_group, "GroupId")],
                    },
                },
                "ServiceRegistries": [{
                    "RegistryArn": intrinsic::get_att(&discovery, "Arn"),
                }],
                "EnableECSManagedTags": true,
            }),
        )
        .depends_on(&capacity.association),
    )?;
    info!(role = role.name(), weight, "declared service");
    Ok(Service {
        role,
        id,
        security_group: Some(security_group),
    })
}

/// Declare the task definition of `workload` and, when `weight` is set, the service keeping it up.
pub fn declare(
    stack: &mut Stack,
    context: &Context,
    network: &Network,
    capacity: &Capacity,
    workload: &Workload,
    weight: Option<u32>,
) -> Result<(TaskDefinition, Option<Service>), Error> {
    let task_definition = declare_task_definition(stack, context, workload)?;
    let Some(weight) = weight else {
        return Ok((task_definition, None));
    };
    let service = declare_service(stack, context, network, capacity, &task_definition, weight)?;
    Ok((task_definition, Some(service)))
}
