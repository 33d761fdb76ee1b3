//! Assemble the full deployment topology.

use crate::erp::{
    grant_ingress, jobs, network, wire_cache_ingress,
    workload::{declare, declare_discovery},
    Cache, Capacity, Config, Context, Error, Network, Role, Service, TaskDefinition, Workload,
    BACKEND_PORT,
};
use erp_template::{intrinsic, Environment, LogicalId, Output, Stack};
use serde_json::Value;
use tracing::{debug, info};

/// Handles to everything declared for one deployment.
#[derive(Clone, Debug)]
pub struct Topology {
    pub stack: Stack,
    pub network: Network,
    pub cache: Cache,
    pub capacity: Capacity,
    pub context: Context,
    /// Task definitions of the long-running roles
    pub task_definitions: Vec<TaskDefinition>,
    pub services: Vec<Service>,
    /// Registry the database runs behind, so jobs reach it by name
    pub database_discovery: LogicalId,
    pub configurator: TaskDefinition,
    pub site_creator: TaskDefinition,
}

impl Topology {
    /// Orderings that must hold as explicit dependencies, as `(dependent, dependency)`.
    pub fn required_orderings(&self) -> Vec<(LogicalId, LogicalId)> {
        vec![
            (self.configurator.id.clone(), self.cache.id.clone()),
            (self.site_creator.id.clone(), self.cache.id.clone()),
        ]
    }

    /// Returns the service of `role`, if it has one.
    pub fn service(&self, role: Role) -> Option<&Service> {
        self.services.iter().find(|service| service.role == role)
    }

    /// Returns the task definition of `role`.
    pub fn task_definition(&self, role: Role) -> Option<&TaskDefinition> {
        self.task_definitions
            .iter()
            .chain([&self.configurator, &self.site_creator])
            .find(|task| task.role == role)
    }

    /// Check the required orderings and render the template.
    pub fn synthesize(&self) -> Result<Value, Error> {
        verify_ordering(&self.stack, &self.required_orderings())?;
        Ok(self.stack.synthesize()?)
    }
}

/// Check that each `(dependent, dependency)` pair is ordered by explicit dependencies.
///
/// Orderings that only follow from property references do not count.
pub fn verify_ordering(stack: &Stack, required: &[(LogicalId, LogicalId)]) -> Result<(), Error> {
    let graph = stack.graph()?;
    for (dependent, dependency) in required {
        if !graph.precedes_explicitly(dependency, dependent) {
            return Err(Error::MissingDependency {
                dependent: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }
        debug!(
            dependent = dependent.as_str(),
            dependency = dependency.as_str(),
            "verified ordering"
        );
    }
    Ok(())
}

/// Declare the complete topology described by `config` into a new stack.
pub fn build(config: &Config, environment: Environment) -> Result<Topology, Error> {
    config.validate()?;
    let mut stack = Stack::new(config.stack_name.as_str(), environment)
        .with_description(format!("ERP deployment of {}", config.image));

    let network = network::build(&mut stack, &config.network)?;
    let cache = Cache::build(&mut stack, &config.cache, &network)?;
    let capacity = Capacity::build(&mut stack, &config.capacity, &network)?;
    let context = Context::build(&mut stack, config, &network)?;

    let mut task_definitions = Vec::new();
    let mut services = Vec::new();
    for role in Role::LONG_RUNNING {
        let workload = Workload::long_running(role, config, &context);
        let weight = config.services.weight(role);
        let (task_definition, service) =
            declare(&mut stack, &context, &network, &capacity, &workload, weight)?;
        task_definitions.push(task_definition);
        services.extend(service);
    }
    let database_discovery = declare_discovery(&mut stack, &context, Role::Database)?;

    let configurator = jobs::wire_configuration_job(&mut stack, config, &context, &cache)?;
    let site_creator = jobs::wire_site_creation_job(&mut stack, config, &context, &cache)?;
    wire_cache_ingress(&mut stack, &cache, &services)?;

    // Frontend proxies to the backend
    let group = |role| {
        services
            .iter()
            .find(|service: &&Service| service.role == role)
            .and_then(|service| service.security_group.clone())
    };
    let backend = group(Role::Backend);
    if let (Some(backend), Some(frontend)) = (&backend, group(Role::Frontend)) {
        grant_ingress(&mut stack, backend, &frontend, BACKEND_PORT)?;
    }

    // Database and one-shot tasks run in the backend group; application roles reach the database
    if let Some(backend) = &backend {
        for role in [Role::Backend, Role::ShortQueue, Role::LongQueue, Role::Scheduler] {
            if let Some(source) = group(role) {
                grant_ingress(&mut stack, backend, &source, config.database.port)?;
            }
        }
    }

    stack.add_output(
        "ClusterName",
        Output::new(intrinsic::reference(&capacity.cluster)).with_description("ECS cluster"),
    )?;
    stack.add_output(
        "PrivateSubnets",
        Output::new(intrinsic::join(
            ",",
            network
                .private_subnets()
                .map(|subnet| intrinsic::reference(&subnet.id)),
        ))
        .with_description("Subnets one-shot tasks must run in"),
    )?;
    if let Some(backend) = &backend {
        stack.add_output(
            "TaskSecurityGroup",
            Output::new(intrinsic::get_att(backend, "GroupId"))
                .with_description("Security group the database and one-shot tasks run with"),
        )?;
    }
    stack.add_output(
        "DatabaseDiscoveryServiceArn",
        Output::new(intrinsic::get_att(&database_discovery, "Arn")).with_description(format!(
            "Registry to run the database behind, resolving {}",
            context.hostname(Role::Database)
        )),
    )?;
    for task in task_definitions
        .iter()
        .filter(|task| !Role::SERVICES.contains(&task.role))
        .chain([&configurator, &site_creator])
    {
        stack.add_output(
            &format!("{}TaskDefinitionArn", task.role.name()),
            Output::new(intrinsic::reference(&task.id))
                .with_description(format!("Run {} as a task", task.role.dns_name())),
        )?;
    }

    let topology = Topology {
        stack,
        network,
        cache,
        capacity,
        context,
        task_definitions,
        services,
        database_discovery,
        configurator,
        site_creator,
    };
    verify_ordering(&topology.stack, &topology.required_orderings())?;
    info!(
        stack = config.stack_name.as_str(),
        resources = topology.stack.resources().count(),
        services = topology.services.len(),
        "built topology"
    );
    Ok(topology)
}
