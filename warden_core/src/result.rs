use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The canonical finding record exchanged between pipeline stages.
///
/// Every stage of the pipeline consumes and produces `CheckResult`s:
/// providers gather one, checkers inject configuration into one, the
/// evaluation backend replaces its `details`, and the report step fills in
/// `formatted`. `details` is always present (possibly empty); `formatted`
/// is only guaranteed non-empty after the report step has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Subject area this record relates to, e.g. a resource family.
    pub relates_to: String,
    /// Unique identifier for this finding within a run.
    pub name: String,
    /// Human summary of what the record represents.
    pub description: String,
    /// Structured payload; object or array of objects, check-specific.
    #[serde(default = "empty_details")]
    pub details: Value,
    /// Human-readable rendering, populated by the report step.
    #[serde(default)]
    pub formatted: String,
}

fn empty_details() -> Value {
    Value::Object(serde_json::Map::new())
}

impl CheckResult {
    pub fn new(
        relates_to: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            relates_to: relates_to.into(),
            name: name.into(),
            description: description.into(),
            details,
            formatted: String::new(),
        }
    }

    /// Synthesize an empty record named after a plugin.
    ///
    /// Used when a providerless checker has no prior results to fall back
    /// on; the evaluator then sees an empty input document.
    pub fn empty(name: &str) -> Self {
        Self::new(name, name, "", empty_details())
    }

    /// Clone this record with its `details` replaced and `formatted` reset.
    pub fn with_details(&self, details: Value) -> Self {
        Self {
            relates_to: self.relates_to.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            details,
            formatted: String::new(),
        }
    }

    /// True when `details` holds at least one entry.
    pub fn has_findings(&self) -> bool {
        match &self.details {
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Null => false,
            _ => true,
        }
    }
}
