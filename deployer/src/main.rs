//! ERP Deployer CLI

use clap::{Arg, ArgAction, Command};
use erp_deployer::{
    crate_version,
    erp::{self, Destination},
};
use erp_template::Environment;
use std::path::PathBuf;
use tracing::{error, info};

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Flag for the configuration file
const CONFIG_FLAG: &str = "config";

/// Flag for the output directory
const OUT_FLAG: &str = "out";

/// Flag for printing the template instead of writing it
const STDOUT_FLAG: &str = "stdout";

/// Entrypoint for the ERP Deployer CLI
fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("erp-deployer")
        .version(crate_version())
        .about("Synthesize the deployment template of a multi-service ERP application.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(CONFIG_FLAG)
                .long(CONFIG_FLAG)
                .help("Path to YAML config file (defaults apply to every missing field)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(OUT_FLAG)
                .long(OUT_FLAG)
                .default_value(erp::DEFAULT_OUT_DIR)
                .help("Directory the template is written to")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(STDOUT_FLAG)
                .long(STDOUT_FLAG)
                .help("Print the template instead of writing it")
                .action(ArgAction::SetTrue)
                .conflicts_with(OUT_FLAG),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    // Synthesize
    let config = matches.get_one::<PathBuf>(CONFIG_FLAG);
    let destination = if matches.get_flag(STDOUT_FLAG) {
        Destination::Stdout
    } else {
        match matches.get_one::<PathBuf>(OUT_FLAG) {
            Some(dir) => Destination::Directory(dir.clone()),
            None => Destination::Directory(PathBuf::from(erp::DEFAULT_OUT_DIR)),
        }
    };
    match erp::synth(config.map(PathBuf::as_path), Environment::from_env(), &destination) {
        Ok(path) => {
            if let Some(path) = path {
                info!(path = ?path, "synthesized");
            }
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error=?e, "failed to synthesize");
            std::process::ExitCode::FAILURE
        }
    }
}
