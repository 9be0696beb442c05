//! Workflow module port.
//!
//! The module is the sandboxed user program. The engine calls it once to
//! learn its trigger subscriptions and once per trigger event.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PortsError;
use crate::helper::ExecutionHelper;

/// What the module is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    /// Report trigger subscriptions.
    Subscribe,
    /// Handle one event of the trigger at `index` in the subscription list.
    Trigger {
        /// Subscription index.
        index: u64,
        /// Event payload.
        payload: serde_json::Value,
    },
}

/// One call into the module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Subscribe or trigger.
    pub kind: RequestKind,
    /// Workflow configuration blob.
    pub config: Vec<u8>,
    /// Largest response the module may produce, in bytes.
    pub max_response_size: u64,
}

/// A trigger the module wants to be woken by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSubscription {
    /// Trigger capability ID.
    pub id: String,
    /// Trigger method.
    pub method: String,
    /// Registration payload.
    pub payload: serde_json::Value,
}

/// What the module returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Answer to a subscribe request.
    TriggerSubscriptions(Vec<TriggerSubscription>),
    /// Successful execution output.
    Value(serde_json::Value),
    /// In-band error reported by the program.
    Error(String),
}

impl ExecutionResult {
    /// The in-band error, if one was reported and is non-empty.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(msg) if !msg.is_empty() => Some(msg),
            _ => None,
        }
    }
}

/// The sandboxed workflow program.
#[async_trait]
pub trait Module: Send + Sync {
    /// Prepare the module for calls.
    fn start(&self);

    /// Run the module once. Dropping the future cancels the run.
    async fn execute(
        &self,
        request: ExecuteRequest,
        helper: Arc<dyn ExecutionHelper>,
    ) -> Result<ExecutionResult, PortsError>;

    /// Release module resources.
    fn close(&self);
}
