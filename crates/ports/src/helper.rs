//! Services the module reaches back into the engine through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use donflow_core::{ExecutionId, WorkflowOwner};

use crate::capability::{CapabilityRequest, CapabilityResponse};
use crate::error::PortsError;
use crate::secrets::{GetSecretsRequest, SecretResponse};

/// Per-execution services handed to [`Module::execute`](crate::Module::execute).
///
/// Each service enforces its own quota; a rejected quota surfaces as
/// [`PortsError::Limit`].
#[async_trait]
pub trait ExecutionHelper: Send + Sync {
    /// The execution being served; `None` while subscribing.
    fn execution_id(&self) -> Option<&ExecutionId>;

    /// Call an executable capability.
    async fn call_capability(&self, request: CapabilityRequest) -> Result<CapabilityResponse, PortsError>;

    /// Fetch a batch of secrets.
    async fn get_secrets(&self, request: GetSecretsRequest) -> Result<Vec<SecretResponse>, PortsError>;

    /// Time agreed by the DON for this execution.
    async fn don_time(&self) -> Result<DateTime<Utc>, PortsError>;

    /// Local wall-clock time.
    fn node_time(&self) -> DateTime<Utc>;

    /// Forward one user log line. Never blocks.
    fn emit_user_log(&self, line: String);
}

/// Source of DON-agreed time.
#[async_trait]
pub trait DonTimeProvider: Send + Sync {
    /// Agreed time for the next request of `execution_id`.
    async fn don_time(&self, execution_id: &ExecutionId) -> Result<DateTime<Utc>, PortsError>;
}

/// Maps owner addresses to billing organizations.
#[async_trait]
pub trait OrgResolver: Send + Sync {
    /// Organization ID of `owner`.
    async fn get(&self, owner: &WorkflowOwner) -> Result<String, PortsError>;
}
