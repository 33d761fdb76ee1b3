//! Declare the ERP deployment topology and synthesize it into a template.
//!
//! The topology is assembled in dependency order: network, cache, cluster capacity, shared task
//! resources, long-running workloads (task definition, service, security group), one-shot jobs,
//! and finally the ingress grants into the cache. Every step only adds declarations to one
//! [erp_template::Stack]; nothing is applied.

use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path};
use thiserror::Error;

mod cache;
pub use cache::{wire_cache_ingress, Cache};
mod cluster;
pub use cluster::Capacity;
mod jobs;
pub use jobs::{wire_configuration_job, wire_site_creation_job};
mod network;
pub use network::{grant_ingress, security_group, Network, Subnet};
pub mod services;
mod synth;
pub use synth::{synth, Destination};
mod topology;
pub use topology::{build, verify_ordering, Topology};
mod workload;
pub use workload::{Context, Role, Service, TaskDefinition, VolumeMount, Workload};

/// Longest stack name the provisioning engine accepts
pub const MAX_STACK_NAME_LEN: usize = 128;

/// Name of the synthesized stack unless configured otherwise
pub const DEFAULT_STACK_NAME: &str = "ErpAwsDeployStack";

/// ERP application image unless configured otherwise
pub const DEFAULT_IMAGE: &str = "frappe/erpnext:v15.62.0";

/// Directory templates are written to unless configured otherwise
pub const DEFAULT_OUT_DIR: &str = "cdk.out";

/// Host path the instance boot script mounts the data volume at
pub const MOUNT_PATH: &str = "/mnt/erp";

/// Data path of every ERP role inside its container
pub const SITES_PATH: &str = "/home/frappe/frappe-bench/sites";

/// Data path of the database inside its container
pub const DATABASE_PATH: &str = "/var/lib/mysql";

/// Port the backend (gunicorn) listens on
pub const BACKEND_PORT: u16 = 8000;

/// Port the frontend (nginx) listens on
pub const FRONTEND_PORT: u16 = 8080;

/// Port the realtime (socket.io) server listens on
pub const SOCKETIO_PORT: u16 = 9000;

/// Errors that can occur while assembling or synthesizing the topology.
#[derive(Error, Debug)]
pub enum Error {
    #[error("template error: {0}")]
    Template(#[from] erp_template::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stack name: {0:?}")]
    InvalidStackName(String),
    #[error("invalid capacity bounds: min={min} desired={desired} max={max}")]
    InvalidCapacity { min: u32, desired: u32, max: u32 },
    #[error("at least one availability zone is required")]
    NoAvailabilityZones,
    #[error("at least one private subnet is required")]
    NoPrivateSubnets,
    #[error("invalid NAT gateway count: {nat_gateways} (public subnets: {public_subnets}, private subnets: {private_subnets})")]
    InvalidNatCount {
        nat_gateways: usize,
        public_subnets: usize,
        private_subnets: usize,
    },
    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),
    #[error("invalid mask /{mask} for subnet {subnet} in a /{vpc_prefix} network")]
    InvalidSubnetMask {
        subnet: String,
        mask: u8,
        vpc_prefix: u8,
    },
    #[error("address space exhausted while allocating {0}")]
    AddressSpaceExhausted(String),
    #[error("invalid polling window: interval={interval}s timeout={timeout}s")]
    InvalidPolling { interval: u64, timeout: u64 },
    #[error("{dependent} does not explicitly depend on {dependency}")]
    MissingDependency {
        dependent: String,
        dependency: String,
    },
}

/// Whether a subnet routes through the internet gateway or a NAT gateway.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubnetKind {
    Public,
    Private,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SubnetConfig {
    pub name: String,
    pub kind: SubnetKind,
    pub cidr_mask: u8,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub cidr: String,
    pub max_azs: usize,
    pub nat_gateways: usize,
    pub subnets: Vec<SubnetConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/16".into(),
            max_azs: 2,
            nat_gateways: 1,
            subnets: vec![
                SubnetConfig {
                    name: "Public".into(),
                    kind: SubnetKind::Public,
                    cidr_mask: 24,
                },
                SubnetConfig {
                    name: "Private".into(),
                    kind: SubnetKind::Private,
                    cidr_mask: 24,
                },
            ],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CapacityConfig {
    pub instance_type: String,
    pub min: u32,
    pub max: u32,
    pub desired: u32,
    /// Size of the secondary data volume in GiB
    pub data_volume_size: u32,
    pub data_device: String,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            instance_type: "t3.micro".into(),
            min: 1,
            max: 4,
            desired: 1,
            data_volume_size: 20,
            data_device: "/dev/xvdb".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub node_type: String,
    pub engine: String,
    pub shards: u32,
    pub replicas: u32,
    pub port: u16,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            node_type: "cache.t3.micro".into(),
            engine: "valkey".into(),
            shards: 1,
            replicas: 1,
            port: 6379,
        }
    }
}

/// Static coordinates of the ERP database.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub image: String,
    pub port: u16,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            image: "mariadb:10.6".into(),
            port: 3306,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SiteConfig {
    pub name: String,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: "frontend".into(),
            poll_interval_secs: 5,
            timeout_secs: 120,
        }
    }
}

/// Memory ceiling and capacity-provider weight of one role.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Hard memory limit in MiB
    pub memory: u32,
    pub weight: u32,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            memory: 256,
            weight: 1,
        }
    }
}

/// Memory ceiling of a role no service keeps running.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TaskConfig {
    /// Hard memory limit in MiB
    pub memory: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { memory: 256 }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ServicesConfig {
    /// Private DNS namespace services register in
    pub namespace: String,
    pub backend: WorkloadConfig,
    pub frontend: WorkloadConfig,
    pub short_queue: WorkloadConfig,
    pub long_queue: WorkloadConfig,
    pub scheduler: WorkloadConfig,
    pub database: TaskConfig,
    pub configurator: TaskConfig,
    pub site_creator: TaskConfig,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            namespace: "erp.local".into(),
            backend: WorkloadConfig::default(),
            frontend: WorkloadConfig::default(),
            short_queue: WorkloadConfig::default(),
            long_queue: WorkloadConfig::default(),
            scheduler: WorkloadConfig::default(),
            database: TaskConfig { memory: 512 },
            configurator: TaskConfig::default(),
            site_creator: TaskConfig::default(),
        }
    }
}

impl ServicesConfig {
    /// Returns the memory ceiling of `role` in MiB.
    pub fn memory(&self, role: Role) -> u32 {
        match role {
            Role::Backend => self.backend.memory,
            Role::Frontend => self.frontend.memory,
            Role::ShortQueue => self.short_queue.memory,
            Role::LongQueue => self.long_queue.memory,
            Role::Scheduler => self.scheduler.memory,
            Role::Database => self.database.memory,
            Role::Configurator => self.configurator.memory,
            Role::SiteCreator => self.site_creator.memory,
        }
    }

    /// Returns the capacity-provider weight of `role`, or `None` if no service runs it.
    pub fn weight(&self, role: Role) -> Option<u32> {
        match role {
            Role::Backend => Some(self.backend.weight),
            Role::Frontend => Some(self.frontend.weight),
            Role::ShortQueue => Some(self.short_queue.weight),
            Role::LongQueue => Some(self.long_queue.weight),
            Role::Scheduler => Some(self.scheduler.weight),
            Role::Database | Role::Configurator | Role::SiteCreator => None,
        }
    }
}

/// Configuration surface of the topology. Every field has a default.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub stack_name: String,
    pub image: String,
    pub network: NetworkConfig,
    pub capacity: CapacityConfig,
    pub cache: CacheConfig,
    pub database: DatabaseConfig,
    pub site: SiteConfig,
    pub services: ServicesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_name: DEFAULT_STACK_NAME.into(),
            image: DEFAULT_IMAGE.into(),
            network: NetworkConfig::default(),
            capacity: CapacityConfig::default(),
            cache: CacheConfig::default(),
            database: DatabaseConfig::default(),
            site: SiteConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

impl Config {
    /// Load a configuration from a YAML file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Check the constraints the provisioning engine cannot check on our behalf.
    pub fn validate(&self) -> Result<(), Error> {
        // The name also lands in file paths and resource names
        let mut name = self.stack_name.chars();
        let valid_name = name.next().is_some_and(|c| c.is_ascii_alphabetic())
            && name.all(|c| c.is_ascii_alphanumeric() || c == '-')
            && self.stack_name.len() <= MAX_STACK_NAME_LEN;
        if !valid_name {
            return Err(Error::InvalidStackName(self.stack_name.clone()));
        }

        let capacity = &self.capacity;
        if capacity.min > capacity.desired || capacity.desired > capacity.max {
            return Err(Error::InvalidCapacity {
                min: capacity.min,
                desired: capacity.desired,
                max: capacity.max,
            });
        }

        let network = &self.network;
        if network.max_azs == 0 {
            return Err(Error::NoAvailabilityZones);
        }
        let count = |kind| {
            network.subnets.iter().filter(|s| s.kind == kind).count() * network.max_azs
        };
        let public_subnets = count(SubnetKind::Public);
        let private_subnets = count(SubnetKind::Private);
        if private_subnets == 0 {
            return Err(Error::NoPrivateSubnets);
        }
        let nat_invalid = network.nat_gateways == 0 || network.nat_gateways > public_subnets;
        if nat_invalid {
            return Err(Error::InvalidNatCount {
                nat_gateways: network.nat_gateways,
                public_subnets,
                private_subnets,
            });
        }

        let site = &self.site;
        if site.poll_interval_secs == 0 || site.timeout_secs < site.poll_interval_secs {
            return Err(Error::InvalidPolling {
                interval: site.poll_interval_secs,
                timeout: site.timeout_secs,
            });
        }
        Ok(())
    }
}
