//! Logical ids and the declarations that live under them.

use crate::Error;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::BTreeSet, fmt};

/// Maximum length of a logical id.
const MAX_LOGICAL_ID_LEN: usize = 255;

/// Template-local name of a parameter, resource, or output.
///
/// Logical ids are 1 to 255 ASCII alphanumeric characters.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LogicalId(String);

impl LogicalId {
    /// Validate `id` and wrap it.
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty()
            || id.len() > MAX_LOGICAL_ID_LEN
            || !id.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::InvalidLogicalId(id));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for LogicalId {
    type Error = Error;

    fn try_from(id: &str) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

/// A single resource declaration.
///
/// Once added to a [crate::Stack], a resource is never modified. Relationships discovered later
/// (for example an ingress grant) are expressed as additional resources.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    kind: String,
    properties: Value,
    depends_on: BTreeSet<LogicalId>,
}

impl Resource {
    /// Declare a resource of type `kind` (e.g. `AWS::EC2::VPC`) with the given properties.
    ///
    /// `properties` must be a JSON object (or `null` for none); this is checked when the
    /// resource is added to a stack.
    pub fn new(kind: impl Into<String>, properties: Value) -> Self {
        Self {
            kind: kind.into(),
            properties,
            depends_on: BTreeSet::new(),
        }
    }

    /// Add an explicit dependency on `id`.
    pub fn depends_on(mut self, id: &LogicalId) -> Self {
        self.depends_on.insert(id.clone());
        self
    }

    /// Add explicit dependencies on every id in `ids`.
    pub fn depends_on_all<'a>(mut self, ids: impl IntoIterator<Item = &'a LogicalId>) -> Self {
        self.depends_on.extend(ids.into_iter().cloned());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn properties(&self) -> &Value {
        &self.properties
    }

    /// Returns the top-level property `name`, if set.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Returns the explicit dependencies of this resource.
    pub fn dependencies(&self) -> &BTreeSet<LogicalId> {
        &self.depends_on
    }

    /// Render the resource as a template entry.
    pub(crate) fn to_template(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("Type".into(), Value::String(self.kind.clone()));
        if !self.properties.is_null() {
            entry.insert("Properties".into(), self.properties.clone());
        }
        if !self.depends_on.is_empty() {
            entry.insert(
                "DependsOn".into(),
                self.depends_on
                    .iter()
                    .map(|id| Value::String(id.to_string()))
                    .collect(),
            );
        }
        Value::Object(entry)
    }
}

/// A deploy-time input to the template.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_echo: bool,
}

impl Parameter {
    /// A plain string parameter.
    pub fn string() -> Self {
        Self {
            kind: "String".into(),
            default: None,
            description: None,
            no_echo: false,
        }
    }

    /// A parameter of an arbitrary (provider-specific) type.
    pub fn of_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::string()
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mask the value in provider consoles and API responses.
    pub fn secret(mut self) -> Self {
        self.no_echo = true;
        self
    }
}

/// A value exported from the template once it has been applied.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Output {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("Vpc"; "simple")]
    #[test_case("PrivateSubnet1"; "with digits")]
    #[test_case("A"; "single character")]
    fn test_logical_id_valid(id: &str) {
        assert_eq!(LogicalId::new(id).unwrap().as_str(), id);
    }

    #[test_case(""; "empty")]
    #[test_case("Private_Subnet"; "underscore")]
    #[test_case("Backend-Service"; "dash")]
    #[test_case("Sübnet"; "non ascii")]
    fn test_logical_id_invalid(id: &str) {
        assert!(matches!(
            LogicalId::new(id),
            Err(Error::InvalidLogicalId(invalid)) if invalid == id
        ));
    }

    #[test]
    fn test_logical_id_too_long() {
        assert!(LogicalId::new("a".repeat(MAX_LOGICAL_ID_LEN)).is_ok());
        assert!(LogicalId::new("a".repeat(MAX_LOGICAL_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_resource_template_entry() {
        let cache = LogicalId::new("Cache").unwrap();
        let vpc = LogicalId::new("Vpc").unwrap();
        let resource = Resource::new("AWS::ECS::TaskDefinition", json!({"Family": "job"}))
            .depends_on(&vpc)
            .depends_on(&cache)
            .depends_on(&cache);
        assert_eq!(resource.dependencies().len(), 2);
        assert_eq!(resource.property("Family"), Some(&json!("job")));
        assert_eq!(
            resource.to_template(),
            json!({
                "Type": "AWS::ECS::TaskDefinition",
                "Properties": {"Family": "job"},
                "DependsOn": ["Cache", "Vpc"],
            })
        );
    }

    #[test]
    fn test_resource_without_properties() {
        let resource = Resource::new("AWS::EC2::InternetGateway", Value::Null);
        assert_eq!(
            resource.to_template(),
            json!({"Type": "AWS::EC2::InternetGateway"})
        );
    }

    #[test]
    fn test_parameter_serialization() {
        let parameter = Parameter::string()
            .with_default("admin")
            .with_description("Root password")
            .secret();
        assert_eq!(
            serde_json::to_value(&parameter).unwrap(),
            json!({
                "Type": "String",
                "Default": "admin",
                "Description": "Root password",
                "NoEcho": true,
            })
        );
        assert_eq!(
            serde_json::to_value(Parameter::of_kind("Number")).unwrap(),
            json!({"Type": "Number"})
        );
    }
}
