//! Synthesize the deployment topology of a multi-service ERP application.
//!
//! The topology (network, container cluster, managed cache, long-running services, and the
//! one-shot jobs that configure the first site) is declared into an [erp_template::Stack] and
//! rendered as a CloudFormation template. Nothing is applied: the template is handed to the
//! provisioning engine.
//!
//! # Status
//!
//! `erp-deployer` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

pub mod erp;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
