//! Quota scopes.
//!
//! Every limit belongs to one level of the global → owner → workflow
//! hierarchy. A [`Tenant`] names the owner and workflow a limiter is built for,
//! and resolves the tenant key for any scope.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{WorkflowId, WorkflowOwner};

/// The level a quota applies at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Shared by every workflow on the node.
    Global,
    /// Shared by every workflow of one owner.
    Owner,
    /// Private to one workflow.
    Workflow,
}

impl Scope {
    /// Name used in limit keys, e.g. `PerWorkflow.TriggerSubscriptionLimit`.
    #[must_use]
    pub const fn key_prefix(self) -> &'static str {
        match self {
            Self::Global => "Global",
            Self::Owner => "PerOwner",
            Self::Workflow => "PerWorkflow",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Owner => f.write_str("owner"),
            Self::Workflow => f.write_str("workflow"),
        }
    }
}

/// The owner and workflow a limiter enforces quotas for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tenant {
    /// Workflow owner, if known.
    pub owner: Option<WorkflowOwner>,
    /// Workflow ID, if known.
    pub workflow: Option<WorkflowId>,
}

impl Tenant {
    /// Tenant for a fully identified workflow.
    #[must_use]
    pub const fn workflow(owner: WorkflowOwner, workflow: WorkflowId) -> Self {
        Self {
            owner: Some(owner),
            workflow: Some(workflow),
        }
    }

    /// Tenant for an owner without a specific workflow.
    #[must_use]
    pub const fn owner(owner: WorkflowOwner) -> Self {
        Self {
            owner: Some(owner),
            workflow: None,
        }
    }

    /// Tenant key for `scope`: empty for global, otherwise the owner or workflow hex.
    #[must_use]
    pub fn key_for(&self, scope: Scope) -> String {
        match scope {
            Scope::Global => String::new(),
            Scope::Owner => self.owner.map(|o| o.to_string()).unwrap_or_default(),
            Scope::Workflow => self.workflow.map(|w| w.to_string()).unwrap_or_default(),
        }
    }
}
