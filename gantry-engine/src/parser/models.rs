// Raw configuration models
// Mirror the YAML file one-to-one; lowered into pipeline::models by the loader

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Top-level configuration document
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPipeline {
    #[serde(default)]
    pub name: Option<String>,

    /// Run-level environment variables
    #[serde(default)]
    pub env: BTreeMap<String, RawScalar>,

    /// Jobs keyed by id; kept as a mapping so declaration order survives
    pub jobs: Mapping,
}

/// One entry under `jobs:`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RawJob {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub needs: RawNeeds,

    #[serde(default)]
    pub env: BTreeMap<String, RawScalar>,

    #[serde(default)]
    pub strategy: Option<RawStrategy>,

    /// Sidecar services keyed by service name
    #[serde(default)]
    pub services: Mapping,

    #[serde(default)]
    pub steps: Vec<RawStep>,

    /// Copy the project source into each instance workspace
    #[serde(default)]
    pub checkout: bool,
}

/// Job dependencies can be a single id or a list
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum RawNeeds {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl RawNeeds {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            RawNeeds::None => vec![],
            RawNeeds::Single(s) => vec![s.clone()],
            RawNeeds::Multiple(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RawStrategy {
    #[serde(default)]
    pub fail_fast: Option<bool>,

    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Axes plus the reserved `exclude` and `include` keys, in declaration order
    #[serde(default)]
    pub matrix: Option<Mapping>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RawStep {
    #[serde(default)]
    pub name: Option<String>,

    pub run: String,

    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default)]
    pub working_directory: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, RawScalar>,

    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default)]
    pub timeout_minutes: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RawService {
    pub image: String,

    #[serde(default)]
    pub version: Option<RawScalar>,

    /// `"6379"` or `"16379:6379"`; bare numbers are accepted too
    #[serde(default)]
    pub ports: Vec<RawScalar>,

    #[serde(default)]
    pub health_check: Option<String>,

    #[serde(default)]
    pub readiness_timeout_seconds: Option<u64>,

    #[serde(default)]
    pub env: BTreeMap<String, RawScalar>,
}

/// A YAML scalar that is used as a string (env values, matrix values, tags)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawScalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl RawScalar {
    /// Convert an arbitrary YAML value; `None` for sequences, mappings and null
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(RawScalar::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(RawScalar::Int)
                .or_else(|| n.as_f64().map(RawScalar::Float)),
            Value::String(s) => Some(RawScalar::Str(s.clone())),
            Value::Tagged(tagged) => Self::from_value(&tagged.value),
            _ => None,
        }
    }
}

impl std::fmt::Display for RawScalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawScalar::Bool(b) => write!(f, "{}", b),
            RawScalar::Int(i) => write!(f, "{}", i),
            RawScalar::Float(x) => write!(f, "{}", x),
            RawScalar::Str(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_forms() {
        let single: RawJob = serde_yaml::from_str("needs: lint\nsteps: []").unwrap();
        assert_eq!(single.needs.to_vec(), vec!["lint"]);

        let multiple: RawJob = serde_yaml::from_str("needs: [lint, test]\nsteps: []").unwrap();
        assert_eq!(multiple.needs.to_vec(), vec!["lint", "test"]);

        let none: RawJob = serde_yaml::from_str("steps: []").unwrap();
        assert!(none.needs.to_vec().is_empty());
    }

    #[test]
    fn test_unknown_step_field_rejected() {
        let result: Result<RawStep, _> = serde_yaml::from_str("run: make\ntimeout: 5");
        assert!(result.is_err());
    }

    #[test]
    fn test_scalar_display() {
        let env: BTreeMap<String, RawScalar> =
            serde_yaml::from_str("A: 1\nB: true\nC: \"3.10\"\nD: 2.5").unwrap();

        assert_eq!(env["A"].to_string(), "1");
        assert_eq!(env["B"].to_string(), "true");
        assert_eq!(env["C"].to_string(), "3.10");
        assert_eq!(env["D"].to_string(), "2.5");
    }
}
