//! Identifiers for workflows, their owners, and their executions.
//!
//! Workflow IDs and owners arrive as bare hex strings (no `0x` prefix) and are
//! validated once at the edge. Execution IDs are derived deterministically so
//! every node of a DON computes the same ID for the same trigger event.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

const WORKFLOW_ID_LEN: usize = 32;
const WORKFLOW_OWNER_LEN: usize = 20;

fn decode_fixed<const N: usize>(value: &str) -> Result<[u8; N], String> {
    if value.starts_with("0x") || value.starts_with("0X") {
        return Err("must not carry a 0x prefix".to_owned());
    }
    let bytes = hex::decode(value).map_err(|e| e.to_string())?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| format!("expected {N} bytes, got {}", bytes.len()))
}

/// A 32-byte workflow identifier, displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkflowId([u8; WORKFLOW_ID_LEN]);

impl WorkflowId {
    /// Wrap raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; WORKFLOW_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the identifier.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; WORKFLOW_ID_LEN] {
        &self.0
    }
}

impl FromStr for WorkflowId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed(s)
            .map(Self)
            .map_err(|reason| CoreError::invalid_workflow_id(s, reason))
    }
}

impl TryFrom<String> for WorkflowId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkflowId> for String {
    fn from(id: WorkflowId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkflowId({self})")
    }
}

/// A 20-byte owner address, displayed as lowercase hex without prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkflowOwner([u8; WORKFLOW_OWNER_LEN]);

impl WorkflowOwner {
    /// Wrap raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; WORKFLOW_OWNER_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the address.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; WORKFLOW_OWNER_LEN] {
        &self.0
    }

    /// The `0x`-prefixed lowercase form used on the vault wire.
    #[must_use]
    pub fn to_prefixed(&self) -> String {
        format!("0x{self}")
    }
}

impl FromStr for WorkflowOwner {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed(s)
            .map(Self)
            .map_err(|reason| CoreError::invalid_workflow_owner(s, reason))
    }
}

impl TryFrom<String> for WorkflowOwner {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkflowOwner> for String {
    fn from(owner: WorkflowOwner) -> Self {
        owner.to_string()
    }
}

impl fmt::Display for WorkflowOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for WorkflowOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkflowOwner({self})")
    }
}

/// Identifier of one workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Derive the execution ID for a trigger event: `hex(sha256(workflow_id ‖ event_id))`.
    #[must_use]
    pub fn derive(workflow_id: &WorkflowId, trigger_event_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(workflow_id.to_string().as_bytes());
        hasher.update(trigger_event_id.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an externally supplied execution ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
