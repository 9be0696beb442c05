//! Label sets attached to events and metrics.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Workflow ID label key.
pub const WORKFLOW_ID: &str = "workflow_id";
/// Workflow owner label key.
pub const WORKFLOW_OWNER: &str = "workflow_owner";
/// Workflow name label key.
pub const WORKFLOW_NAME: &str = "workflow_name";
/// Workflow tag label key.
pub const WORKFLOW_TAG: &str = "workflow_tag";
/// Execution ID label key.
pub const EXECUTION_ID: &str = "workflow_execution_id";
/// Organization ID label key.
pub const ORG_ID: &str = "org_id";
/// Trigger capability ID label key.
pub const TRIGGER_ID: &str = "trigger_id";

/// Ordered key/value tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a label.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Add or replace a label in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a label.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterate labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether no labels are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}
