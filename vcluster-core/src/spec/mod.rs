use std::io::Read;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod cluster;
mod resolver;
mod substitution;

pub use cluster::{ClusterSpec, NodeSpec};
pub use resolver::resolve;
use resolver::check_resolved;

/// Top-level key holding the named templates.
pub const TEMPLATES_KEY: &str = "templates";
/// Key marking an object as an extension of a template.
pub const EXTENDS_KEY: &str = "!extends";
/// Key whose object values are merged by key instead of being replaced.
pub const ENV_KEY: &str = "env";

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("Spec root must be an object!")]
    NotAnObject,
    #[error("Unsupported value at '{path}': only strings, integers, booleans, lists and objects are allowed!")]
    InvalidType { path: String },
    #[error("'!extends' at '{path}' must be a template name!")]
    InvalidExtends { path: String },
    #[error("Unknown template '{name}' referenced at '{path}'!")]
    UnknownTemplate { name: String, path: String },
    #[error("Template '{name}' must be an object!")]
    InvalidTemplate { name: String },
    #[error("Circular template inheritance: {}", .chain.join(" -> "))]
    CircularExtends { chain: Vec<String> },
    #[error("Undefined substitution variable '%{name}%' at '{path}'!")]
    UndefinedVariable { name: String, path: String },
    #[error("Circular substitution of '%{name}%' at '{path}'!")]
    CircularSubstitution { name: String, path: String },
    #[error("Substitution at '{path}' forms a new placeholder '{token}'!")]
    AmbiguousSubstitution { token: String, path: String },
    #[error("'{path}' isn't resolved!")]
    Unresolved { path: String },
    #[error("Invalid cluster spec: {}", .0)]
    InvalidCluster(String),
    #[error("Couldn't parse the spec: {}", .0)]
    ParseError(String),
    #[error("Io error: {}", .0)]
    IoError(std::io::Error),
}

/// A resolved spec tree.
///
/// Only produced by [`resolve`] (or by reading back a tree that was resolved
/// before), so it never contains templates, `!extends` markers or `%NAME%`
/// placeholders. Equality is structural, key order is ignored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Spec(Map<String, Value>);

impl Spec {
    pub(crate) fn from_resolved(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Resolves a raw spec given as YAML (JSON being a subset of it).
    pub fn from_yaml_str(raw: &str) -> Result<Self, SpecError> {
        let value: Value =
            serde_yaml::from_str(raw).map_err(|e| SpecError::ParseError(e.to_string()))?;

        resolve(&value)
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self, SpecError> {
        let mut raw = String::new();
        reader
            .read_to_string(&mut raw)
            .map_err(SpecError::IoError)?;

        Self::from_yaml_str(&raw)
    }

    /// Reads back a spec persisted with [`Spec::to_json`].
    ///
    /// The stored tree is taken as is, nothing gets substituted again. A tree
    /// still carrying templates, `!extends` or placeholders is rejected.
    pub fn from_json(serialized: &str) -> Result<Self, SpecError> {
        let value: Value =
            serde_json::from_str(serialized).map_err(|e| SpecError::ParseError(e.to_string()))?;

        check_resolved(value)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("name").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn cluster(&self) -> Result<ClusterSpec, SpecError> {
        ClusterSpec::from_spec(self)
    }
}

pub(crate) fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_owned()
    } else {
        format!("{parent}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn spec_equality_ignores_key_order() {
        let left = resolve(&json!({"name": "c", "image": "i", "nodes": []})).unwrap();
        let right = resolve(&json!({"nodes": [], "image": "i", "name": "c"})).unwrap();

        assert_eq!(left, right);
    }

    #[test]
    fn spec_survives_json_persistence() {
        let spec = resolve(&json!({
            "name": "c",
            "templates": {"t": {"port": 10000, "host": "%hostname%"}},
            "nodes": [{"hostname": "node-1", "!extends": "t"}],
        }))
        .unwrap();

        let restored = Spec::from_json(&spec.to_json()).unwrap();

        assert_eq!(spec, restored);
        assert_eq!(restored.name(), Some("c"));
    }

    #[test]
    fn percent_signs_survive_json_persistence() {
        let spec = resolve(&json!({
            "name": "c",
            "pct": "50%",
            "line": "used %pct% of %name%%",
        }))
        .unwrap();
        assert_eq!(spec.get("line"), Some(&json!("used 50% of c%")));

        let restored = Spec::from_json(&spec.to_json()).unwrap();

        assert_eq!(spec, restored);
        assert_eq!(resolve(&restored.into_value()).unwrap(), spec);
    }

    #[test]
    fn stored_trees_must_be_resolved() {
        let templated = r#"{"name":"c","templates":{"t":{}},"nodes":[]}"#;
        let extending = r#"{"name":"c","nodes":[{"!extends":"t"}]}"#;
        let placeholder = r#"{"name":"c","nodes":[{"hostname":"%name%-1"}]}"#;

        for stored in [templated, extending, placeholder] {
            assert!(
                matches!(Spec::from_json(stored), Err(SpecError::Unresolved { .. })),
                "{stored}"
            );
        }
    }

    #[test]
    fn yaml_floats_are_rejected() {
        let result = Spec::from_yaml_str("name: c\nratio: 0.5\n");

        assert!(matches!(result, Err(SpecError::InvalidType { path }) if path == "ratio"));
    }
}
