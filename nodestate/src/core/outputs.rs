//! Typed step outputs and resource usage.

use super::Artifact;
use crate::errors::{NodeStateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A named output parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name, unique within its outputs.
    pub name: String,
    /// Parameter value.
    pub value: String,
}

impl Parameter {
    /// Creates a new parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Outputs produced by a step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outputs {
    /// Output parameters, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    /// Output artifacts, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    /// Raw result of the step (the response body for HTTP steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Container exit code, for pod steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<String>,
}

impl Outputs {
    /// Creates empty outputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter, replacing any existing parameter of the same name.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let param = Parameter::new(name, value);
        match self.parameters.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => existing.value = param.value,
            None => self.parameters.push(param),
        }
        self
    }

    /// Adds an artifact.
    #[must_use]
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Sets the raw result.
    #[must_use]
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Returns the value of the named parameter.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Returns true when there is nothing in the outputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
            && self.artifacts.is_empty()
            && self.result.is_none()
            && self.exit_code.is_none()
    }

    /// Checks that parameter and artifact names are unique.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for p in &self.parameters {
            if !seen.insert(p.name.as_str()) {
                return Err(NodeStateError::validation(format!(
                    "duplicate output parameter '{}'",
                    p.name
                )));
            }
        }
        seen.clear();
        for a in &self.artifacts {
            if !seen.insert(a.name.as_str()) {
                return Err(NodeStateError::validation(format!(
                    "duplicate output artifact '{}'",
                    a.name
                )));
            }
        }
        Ok(())
    }
}

/// Resource usage in seconds, keyed by resource name (`cpu`, `memory`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcesDuration(BTreeMap<String, i64>);

impl ResourcesDuration {
    /// Creates an empty duration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a single resource.
    #[must_use]
    pub fn with(mut self, resource: impl Into<String>, seconds: i64) -> Self {
        self.0.insert(resource.into(), seconds);
        self
    }

    /// Returns the seconds recorded for a resource.
    #[must_use]
    pub fn get(&self, resource: &str) -> Option<i64> {
        self.0.get(resource).copied()
    }

    /// Adds every resource of `other` into this one.
    pub fn add(&mut self, other: &Self) {
        for (name, seconds) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += seconds;
        }
    }

    /// Returns true when no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over (resource, seconds).
    pub fn iter(&self) -> impl Iterator<Item = (&String, &i64)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_parameter_replaces() {
        let outputs = Outputs::new()
            .with_parameter("out", "1")
            .with_parameter("out", "2");
        assert_eq!(outputs.parameters.len(), 1);
        assert_eq!(outputs.parameter("out"), Some("2"));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let outputs = Outputs {
            parameters: vec![Parameter::new("a", "1"), Parameter::new("a", "2")],
            ..Outputs::default()
        };
        assert!(outputs.validate().is_err());
        assert!(Outputs::new().with_parameter("a", "1").validate().is_ok());
    }

    #[test]
    fn test_resources_duration_add() {
        let mut total = ResourcesDuration::new().with("cpu", 2);
        total.add(&ResourcesDuration::new().with("cpu", 3).with("memory", 7));
        assert_eq!(total.get("cpu"), Some(5));
        assert_eq!(total.get("memory"), Some(7));
    }

    #[test]
    fn test_empty_outputs_serialize_compactly() {
        assert_eq!(serde_json::to_string(&Outputs::new()).unwrap(), "{}");
        assert!(Outputs::new().is_empty());
    }
}
