//! Synthesize the topology into a template on disk (or standard output).

use crate::erp::{build, Config, Error};
use erp_template::Environment;
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::info;

/// Where a synthesized template is written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    /// `<dir>/<stack_name>.template.json`
    Directory(PathBuf),
}

/// Load `config` (or the defaults), build the topology for `environment`, and write its template.
///
/// Returns the path written to, if any.
pub fn synth(
    config: Option<&Path>,
    environment: Environment,
    destination: &Destination,
) -> Result<Option<PathBuf>, Error> {
    let config = match config {
        Some(path) => {
            info!(path = ?path, "loading configuration");
            Config::load(path)?
        }
        None => Config::default(),
    };
    info!(
        stack = config.stack_name.as_str(),
        account = environment.account.as_deref().unwrap_or("unknown"),
        region = environment.region.as_deref().unwrap_or("unknown"),
        "synthesizing"
    );
    let topology = build(&config, environment)?;
    let template = topology.synthesize()?;
    let rendered = serde_json::to_string_pretty(&template)?;

    match destination {
        Destination::Stdout => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(rendered.as_bytes())?;
            stdout.write_all(b"\n")?;
            Ok(None)
        }
        Destination::Directory(dir) => {
            fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}.template.json", config.stack_name));
            fs::write(&path, rendered)?;
            info!(path = ?path, "wrote template");
            Ok(Some(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_synth_to_directory() {
        let dir = std::env::temp_dir().join(format!("erp_deployer_synth_{}", std::process::id()));
        let path = synth(None, Environment::agnostic(), &Destination::Directory(dir.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(path, dir.join("ErpAwsDeployStack.template.json"));

        let template: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        fs::remove_dir_all(&dir).ok();
        assert_eq!(template["AWSTemplateFormatVersion"], "2010-09-09");
        assert!(template["Resources"]["Cache"].is_object());
    }

    #[test]
    fn test_synth_with_config_file() {
        let dir = std::env::temp_dir().join(format!("erp_deployer_synth_cfg_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let config = dir.join("config.yaml");
        fs::write(&config, "stack_name: Staging\n").unwrap();
        let path = synth(
            Some(&config),
            Environment::agnostic(),
            &Destination::Directory(dir.join("out")),
        )
        .unwrap()
        .unwrap();
        let exists = path.exists();
        fs::remove_dir_all(&dir).ok();
        assert!(exists);
        assert!(path.ends_with("out/Staging.template.json"));
    }

    #[test]
    fn test_synth_invalid_config_writes_nothing() {
        let dir = std::env::temp_dir().join(format!("erp_deployer_synth_bad_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let config = dir.join("config.yaml");
        fs::write(&config, "capacity:\n  min: 9\n").unwrap();
        let out = dir.join("out");
        let result = synth(Some(&config), Environment::agnostic(), &Destination::Directory(out.clone()));
        let exists = out.exists();
        fs::remove_dir_all(&dir).ok();
        assert!(matches!(result, Err(Error::InvalidCapacity { .. })));
        assert!(!exists);
    }

    #[test]
    fn test_synth_keeps_template_inside_out_dir() {
        let dir = std::env::temp_dir().join(format!("erp_deployer_synth_name_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let config = dir.join("config.yaml");
        fs::write(&config, "stack_name: ../escaped\n").unwrap();
        let result = synth(
            Some(&config),
            Environment::agnostic(),
            &Destination::Directory(dir.join("out")),
        );
        let escaped = dir.join("escaped.template.json").exists();
        fs::remove_dir_all(&dir).ok();
        assert!(matches!(result, Err(Error::InvalidStackName(name)) if name == "../escaped"));
        assert!(!escaped);
    }
}
