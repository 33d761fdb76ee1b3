//! The container every declaration is added to.

use crate::{intrinsic, Environment, Error, Graph, LogicalId, Output, Parameter, Resource};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Template format version emitted by [Stack::synthesize].
pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// An ordered set of parameter, resource, and output declarations.
///
/// Parameters and resources share one namespace (both can be the target of a `Ref`); outputs
/// have their own. Declarations are append-only.
#[derive(Clone, Debug)]
pub struct Stack {
    name: String,
    description: Option<String>,
    environment: Environment,
    parameters: Vec<(LogicalId, Parameter)>,
    resources: Vec<(LogicalId, Resource)>,
    outputs: Vec<(LogicalId, Output)>,
    index: HashMap<LogicalId, usize>,
    declared: HashSet<LogicalId>,
}

impl Stack {
    pub fn new(name: impl Into<String>, environment: Environment) -> Self {
        Self {
            name: name.into(),
            description: None,
            environment,
            parameters: Vec::new(),
            resources: Vec::new(),
            outputs: Vec::new(),
            index: HashMap::new(),
            declared: HashSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Declare a parameter under `id`.
    pub fn add_parameter(&mut self, id: &str, parameter: Parameter) -> Result<LogicalId, Error> {
        let id = self.claim(id)?;
        debug!(id = id.as_str(), kind = parameter.kind.as_str(), "declared parameter");
        self.parameters.push((id.clone(), parameter));
        Ok(id)
    }

    /// Declare a resource under `id` and return its logical id.
    pub fn add(&mut self, id: &str, resource: Resource) -> Result<LogicalId, Error> {
        if !resource.properties().is_object() && !resource.properties().is_null() {
            return Err(Error::InvalidProperties(id.to_string()));
        }
        let id = self.claim(id)?;
        debug!(id = id.as_str(), kind = resource.kind(), "declared resource");
        self.index.insert(id.clone(), self.resources.len());
        self.resources.push((id.clone(), resource));
        Ok(id)
    }

    /// Declare an output under `id`.
    pub fn add_output(&mut self, id: &str, output: Output) -> Result<LogicalId, Error> {
        let id = LogicalId::new(id)?;
        if self.outputs.iter().any(|(existing, _)| existing == &id) {
            return Err(Error::DuplicateLogicalId(id.to_string()));
        }
        self.outputs.push((id.clone(), output));
        Ok(id)
    }

    fn claim(&mut self, id: &str) -> Result<LogicalId, Error> {
        let id = LogicalId::new(id)?;
        if !self.declared.insert(id.clone()) {
            return Err(Error::DuplicateLogicalId(id.to_string()));
        }
        Ok(id)
    }

    /// Returns the resource declared under `id`.
    pub fn resource(&self, id: &LogicalId) -> Option<&Resource> {
        self.index.get(id).map(|i| &self.resources[*i].1)
    }

    /// Returns true if `id` names a resource.
    pub fn is_resource(&self, id: &str) -> bool {
        LogicalId::new(id).is_ok_and(|id| self.index.contains_key(&id))
    }

    /// Returns true if `id` names a parameter or a resource.
    pub fn is_declared(&self, id: &str) -> bool {
        LogicalId::new(id).is_ok_and(|id| self.declared.contains(&id))
    }

    /// Iterate over resources in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = (&LogicalId, &Resource)> {
        self.resources.iter().map(|(id, resource)| (id, resource))
    }

    /// Iterate over resources of type `kind` in declaration order.
    pub fn resources_of_kind<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a LogicalId, &'a Resource)> + 'a {
        self.resources().filter(move |(_, resource)| resource.kind() == kind)
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&LogicalId, &Parameter)> {
        self.parameters.iter().map(|(id, parameter)| (id, parameter))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&LogicalId, &Output)> {
        self.outputs.iter().map(|(id, output)| (id, output))
    }

    /// Returns the output declared under `id`.
    pub fn output(&self, id: &str) -> Option<&Output> {
        self.outputs
            .iter()
            .find(|(existing, _)| existing.as_str() == id)
            .map(|(_, output)| output)
    }

    /// Derive the dependency graph of all resources.
    ///
    /// Fails if any resource references an undeclared id.
    pub fn graph(&self) -> Result<Graph, Error> {
        Graph::build(self)
    }

    /// Render the stack as a template.
    ///
    /// Fails on dangling references (from resources or outputs) and on dependency cycles.
    pub fn synthesize(&self) -> Result<Value, Error> {
        let graph = self.graph()?;
        graph.order()?;
        for (id, output) in &self.outputs {
            if let Some(to) = intrinsic::references(&output.value)
                .into_iter()
                .find(|to| !self.is_declared(to))
            {
                return Err(Error::DanglingReference {
                    from: id.to_string(),
                    to,
                });
            }
        }

        let mut template = Map::new();
        template.insert(
            "AWSTemplateFormatVersion".into(),
            Value::String(TEMPLATE_FORMAT_VERSION.into()),
        );
        if let Some(description) = &self.description {
            template.insert("Description".into(), Value::String(description.clone()));
        }
        if !self.parameters.is_empty() {
            let parameters = self
                .parameters
                .iter()
                .map(|(id, parameter)| {
                    serde_json::to_value(parameter).map(|value| (id.to_string(), value))
                })
                .collect::<Result<Map<String, Value>, serde_json::Error>>()?;
            template.insert("Parameters".into(), Value::Object(parameters));
        }
        let resources = self
            .resources
            .iter()
            .map(|(id, resource)| (id.to_string(), resource.to_template()))
            .collect();
        template.insert("Resources".into(), Value::Object(resources));
        if !self.outputs.is_empty() {
            let outputs = self
                .outputs
                .iter()
                .map(|(id, output)| {
                    serde_json::to_value(output).map(|value| (id.to_string(), value))
                })
                .collect::<Result<Map<String, Value>, serde_json::Error>>()?;
            template.insert("Outputs".into(), Value::Object(outputs));
        }
        debug!(
            stack = self.name.as_str(),
            resources = self.resources.len(),
            "synthesized template"
        );
        Ok(Value::Object(template))
    }
}
