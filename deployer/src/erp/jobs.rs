//! One-shot jobs that configure the shared bench and create the first site.
//!
//! Both jobs read the cache endpoint at deploy time, so both task definitions explicitly depend
//! on the replication group.

use crate::erp::{
    services, workload::declare_task_definition, Cache, Config, Context, Error, Role,
    TaskDefinition, VolumeMount, Workload, SOCKETIO_PORT,
};
use erp_template::{intrinsic, Stack};
use serde_json::json;
use tracing::info;

/// Base workload of a job: shared volume, connection details, and an explicit wait on the cache.
fn job(role: Role, config: &Config, context: &Context, cache: &Cache) -> Workload {
    Workload::new(role, config.image.as_str(), config.services.memory(role))
        .with_volume(VolumeMount::data(role))
        .with_env("REDIS_URL", cache.connection_string())
        .with_env("DB_HOST", json!(context.hostname(Role::Database)))
        .with_env("DB_PORT", json!(config.database.port.to_string()))
        .with_env("SOCKETIO_PORT", json!(SOCKETIO_PORT.to_string()))
        .after(&cache.id)
}

/// Declare the job writing the cache and database coordinates into the shared site configuration.
pub fn wire_configuration_job(
    stack: &mut Stack,
    config: &Config,
    context: &Context,
    cache: &Cache,
) -> Result<TaskDefinition, Error> {
    let workload = job(Role::Configurator, config, context, cache)
        .with_command(["bash", "-c", services::CONFIGURE_SITE_CMD]);
    let task_definition = declare_task_definition(stack, context, &workload)?;
    info!(task = task_definition.id.as_str(), "wired configuration job");
    Ok(task_definition)
}

/// Declare the job that waits for the shared site configuration and then creates the site.
pub fn wire_site_creation_job(
    stack: &mut Stack,
    config: &Config,
    context: &Context,
    cache: &Cache,
) -> Result<TaskDefinition, Error> {
    let site = &config.site;
    let command = services::create_site_cmd(site.poll_interval_secs, site.timeout_secs);
    let workload = job(Role::SiteCreator, config, context, cache)
        .with_env("SITE_NAME", json!(site.name))
        .with_env(
            "DB_ROOT_PASSWORD",
            intrinsic::reference(&context.db_root_password),
        )
        .with_env(
            "ADMIN_PASSWORD",
            intrinsic::reference(&context.admin_password),
        )
        .with_command(["bash".to_string(), "-c".to_string(), command]);
    let task_definition = declare_task_definition(stack, context, &workload)?;
    info!(
        task = task_definition.id.as_str(),
        site = site.name.as_str(),
        interval = site.poll_interval_secs,
        timeout = site.timeout_secs,
        "wired site creation job"
    );
    Ok(task_definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erp::network;
    use erp_template::{Edge, Environment, LogicalId};
    use serde_json::Value;

    fn setup() -> (Stack, Config, Context, Cache) {
        let config = Config::default();
        let mut stack = Stack::new("Test", Environment::agnostic());
        let network = network::build(&mut stack, &config.network).unwrap();
        let cache = Cache::build(&mut stack, &config.cache, &network).unwrap();
        let context = Context::build(&mut stack, &config, &network).unwrap();
        (stack, config, context, cache)
    }

    fn environment(stack: &Stack, id: &LogicalId) -> Vec<(String, Value)> {
        stack.resource(id).unwrap().properties()["ContainerDefinitions"][0]["Environment"]
            .as_array()
            .unwrap()
            .iter()
            .map(|pair| (pair["Name"].as_str().unwrap().to_string(), pair["Value"].clone()))
            .collect()
    }

    #[test]
    fn test_configuration_job() {
        let (mut stack, config, context, cache) = setup();
        let task = wire_configuration_job(&mut stack, &config, &context, &cache).unwrap();
        assert_eq!(task.role, Role::Configurator);

        let graph = stack.graph().unwrap();
        assert_eq!(graph.edge(&task.id, &cache.id), Some(Edge::Explicit));

        let environment = environment(&stack, &task.id);
        assert_eq!(
            environment,
            vec![
                ("REDIS_URL".to_string(), cache.connection_string()),
                ("DB_HOST".to_string(), json!("db.erp.local")),
                ("DB_PORT".to_string(), json!("3306")),
                ("SOCKETIO_PORT".to_string(), json!("9000")),
            ]
        );
        let container = &stack.resource(&task.id).unwrap().properties()["ContainerDefinitions"][0];
        assert_eq!(container["Command"][2], json!(services::CONFIGURE_SITE_CMD));
        assert_eq!(container["MountPoints"][0]["ContainerPath"], json!(crate::erp::SITES_PATH));
    }

    #[test]
    fn test_site_creation_job() {
        let (mut stack, mut config, context, cache) = setup();
        config.site.name = "erp.example.com".into();
        config.site.poll_interval_secs = 2;
        config.site.timeout_secs = 30;
        let task = wire_site_creation_job(&mut stack, &config, &context, &cache).unwrap();

        let graph = stack.graph().unwrap();
        assert!(graph.precedes_explicitly(&cache.id, &task.id));

        let environment = environment(&stack, &task.id);
        let names: Vec<&str> = environment.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "REDIS_URL",
                "DB_HOST",
                "DB_PORT",
                "SOCKETIO_PORT",
                "SITE_NAME",
                "DB_ROOT_PASSWORD",
                "ADMIN_PASSWORD",
            ]
        );
        assert_eq!(environment[4].1, json!("erp.example.com"));
        assert_eq!(environment[5].1, json!({"Ref": "DbRootPassword"}));

        let container = &stack.resource(&task.id).unwrap().properties()["ContainerDefinitions"][0];
        let script = container["Command"][2].as_str().unwrap();
        assert!(script.contains("sleep 2"));
        assert!(script.contains("-ge 30"));
        stack.synthesize().unwrap();
    }

    #[test]
    fn test_jobs_follow_the_namespace() {
        let mut config = Config::default();
        config.services.namespace = "corp.internal".into();
        let mut stack = Stack::new("Test", Environment::agnostic());
        let network = network::build(&mut stack, &config.network).unwrap();
        let cache = Cache::build(&mut stack, &config.cache, &network).unwrap();
        let context = Context::build(&mut stack, &config, &network).unwrap();
        let task = wire_configuration_job(&mut stack, &config, &context, &cache).unwrap();
        assert!(environment(&stack, &task.id)
            .contains(&("DB_HOST".to_string(), json!("db.corp.internal"))));
    }
}
