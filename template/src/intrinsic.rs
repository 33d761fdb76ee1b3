//! Intrinsic functions resolved by the provisioning engine.
//!
//! Each helper returns the JSON form the engine expects, so intrinsics nest freely inside
//! `serde_json::json!` property trees. [references] recovers the logical ids a property tree
//! points at; those become the implicit edges of the [crate::Graph].

use crate::LogicalId;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// Prefix shared by all pseudo parameters.
const PSEUDO_PREFIX: &str = "AWS::";

/// Region the stack is deployed to.
pub const REGION: &str = "AWS::Region";

/// Account the stack is deployed to.
pub const ACCOUNT_ID: &str = "AWS::AccountId";

/// Name of the stack.
pub const STACK_NAME: &str = "AWS::StackName";

/// Partition of the deployment region (`aws`, `aws-cn`, ...).
pub const PARTITION: &str = "AWS::Partition";

/// `{"Ref": id}`: the primary identifier of a resource or the value of a parameter.
pub fn reference(id: &LogicalId) -> Value {
    json!({ "Ref": id.as_str() })
}

/// `{"Ref": "AWS::..."}`: the value of a pseudo parameter.
pub fn pseudo(name: &str) -> Value {
    json!({ "Ref": name })
}

/// `{"Fn::GetAtt": [id, attribute]}`: an attribute of a resource.
pub fn get_att(id: &LogicalId, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [id.as_str(), attribute] })
}

/// `{"Fn::Join": [separator, parts]}`.
pub fn join(separator: &str, parts: impl IntoIterator<Item = Value>) -> Value {
    let parts: Vec<Value> = parts.into_iter().collect();
    json!({ "Fn::Join": [separator, parts] })
}

/// `{"Fn::Base64": value}`.
pub fn base64(value: Value) -> Value {
    json!({ "Fn::Base64": value })
}

/// `{"Fn::Select": [index, list]}`.
pub fn select(index: usize, list: Value) -> Value {
    json!({ "Fn::Select": [index.to_string(), list] })
}

/// `{"Fn::GetAZs": region}`: availability zones of `region`, or of the deployment region if empty.
pub fn get_azs(region: &str) -> Value {
    json!({ "Fn::GetAZs": region })
}

/// Collect the logical ids referenced (via `Ref` or `Fn::GetAtt`) anywhere in `value`.
///
/// Pseudo parameters are not logical ids and are skipped.
pub fn references(value: &Value) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    collect(value, &mut found);
    found
}

fn collect(value: &Value, found: &mut BTreeSet<String>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect(item, found)),
        Value::Object(map) => {
            if let Some(target) = intrinsic_target(map) {
                if !target.starts_with(PSEUDO_PREFIX) {
                    found.insert(target.to_string());
                }
                return;
            }
            map.values().for_each(|item| collect(item, found));
        }
        _ => {}
    }
}

/// Returns the referenced id if `map` is a single-key `Ref` or `Fn::GetAtt` object.
fn intrinsic_target(map: &Map<String, Value>) -> Option<&str> {
    if map.len() != 1 {
        return None;
    }
    if let Some(target) = map.get("Ref") {
        return target.as_str();
    }
    match map.get("Fn::GetAtt")? {
        Value::Array(parts) => parts.first()?.as_str(),
        Value::String(dotted) => dotted.split('.').next(),
        _ => None,
    }
}
