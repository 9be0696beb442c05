//! Secrets request/response types and the fetcher port.

use async_trait::async_trait;
use donflow_core::ExecutionId;
use serde::{Deserialize, Serialize};

use crate::error::PortsError;

/// Namespace used when a request leaves it empty.
pub const DEFAULT_NAMESPACE: &str = "main";

/// One named secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRequest {
    /// Secret key.
    pub id: String,
    /// Namespace, empty for [`DEFAULT_NAMESPACE`].
    #[serde(default)]
    pub namespace: String,
}

impl SecretRequest {
    /// Request `id` in `namespace`.
    pub fn new(id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
        }
    }

    /// Namespace with the default applied.
    #[must_use]
    pub fn namespace_or_default(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }
}

/// A batch of secrets resolved in one vault round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSecretsRequest {
    /// Requested secrets.
    pub requests: Vec<SecretRequest>,
    /// Module-side callback the batch answers.
    pub callback_id: i32,
}

/// Outcome for one requested secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretResponse {
    /// Secret key.
    pub id: String,
    /// Namespace with the default applied.
    pub namespace: String,
    /// Canonical owner address.
    pub owner: String,
    /// Plaintext value, or why it could not be produced.
    pub result: Result<String, String>,
}

impl SecretResponse {
    /// Successful response.
    pub fn value(
        id: impl Into<String>,
        namespace: impl Into<String>,
        owner: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            owner: owner.into(),
            result: Ok(value.into()),
        }
    }

    /// Failed response.
    pub fn error(
        id: impl Into<String>,
        namespace: impl Into<String>,
        owner: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            owner: owner.into(),
            result: Err(error.into()),
        }
    }
}

/// Resolves secrets for one workflow.
///
/// `Err` is reserved for failures of the whole batch; per-secret failures
/// come back as [`SecretResponse`] errors.
#[async_trait]
pub trait SecretsFetcher: Send + Sync {
    /// Resolve `request` on behalf of `execution_id`.
    async fn get_secrets(
        &self,
        execution_id: &ExecutionId,
        request: GetSecretsRequest,
    ) -> Result<Vec<SecretResponse>, PortsError>;
}
