//! Declare cloud resources and synthesize them into a provisioning template.
//!
//! A [Stack] collects [Resource] declarations under validated [LogicalId]s. Resources refer to
//! each other with the intrinsics in [intrinsic] (`Ref`, `Fn::GetAtt`, ...) and may name explicit
//! dependencies. The [Graph] derived from a stack answers ordering questions and produces a
//! deterministic creation order. [Stack::synthesize] renders the whole declaration as a
//! CloudFormation template.
//!
//! # Status
//!
//! `erp-template` is **ALPHA** software. Only the template sections required by the ERP topology
//! are supported (parameters, resources, outputs).

use thiserror::Error;

mod environment;
pub use environment::{Environment, ACCOUNT_VAR, REGION_VAR};
mod graph;
pub use graph::{Edge, Graph};
pub mod intrinsic;
mod resource;
pub use resource::{LogicalId, Output, Parameter, Resource};
mod stack;
pub use stack::{Stack, TEMPLATE_FORMAT_VERSION};

/// Errors that can occur when declaring or synthesizing a [Stack].
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid logical id: {0:?}")]
    InvalidLogicalId(String),
    #[error("duplicate logical id: {0}")]
    DuplicateLogicalId(String),
    #[error("properties of {0} must be a JSON object")]
    InvalidProperties(String),
    #[error("{from} references unknown logical id {to}")]
    DanglingReference { from: String, to: String },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
