//! Capability registry and capability ports.
//!
//! Triggers deliver events over a channel handed back at registration;
//! executables answer one request at a time. The registry resolves both by
//! capability ID and describes the DON topology secrets fetching needs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PortsError;

/// A decentralized oracle network: the peers that jointly run something.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Don {
    /// DON identifier.
    pub id: u32,
    /// Peer IDs of the members.
    pub members: Vec<String>,
    /// Fault tolerance.
    pub f: u8,
}

/// A node as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Peer ID of the node.
    pub peer_id: String,
    /// Workflow DON the node belongs to.
    pub workflow_don: Don,
    /// X25519 public key shares are sealed to.
    pub encryption_public_key: [u8; 32],
}

/// Kind of capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    /// Event source.
    Trigger,
    /// Request/response action.
    Action,
    /// Consensus over observations.
    Consensus,
    /// Chain write.
    Target,
}

/// Registry description of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    /// Capability ID, e.g. `vault@1.0.0`.
    pub id: String,
    /// Capability kind.
    pub capability_type: CapabilityType,
    /// Whether the capability runs on the local node.
    pub is_local: bool,
    /// Remote DON hosting the capability.
    pub don: Option<Don>,
}

/// Per-DON configuration of a capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityConfiguration {
    /// Capability-specific default configuration.
    pub default_config: serde_json::Value,
}

/// Workflow context attached to capability calls and trigger registrations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Workflow ID hex.
    pub workflow_id: String,
    /// Workflow owner hex.
    pub workflow_owner: String,
    /// Execution ID, empty outside executions.
    pub workflow_execution_id: String,
    /// Workflow name.
    pub workflow_name: String,
    /// Workflow tag.
    pub workflow_tag: String,
    /// Workflow DON ID.
    pub workflow_don_id: u32,
    /// Step reference within the workflow.
    pub reference_id: String,
}

/// A call to an executable capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// Target capability ID.
    pub capability_id: String,
    /// Method to invoke.
    pub method: String,
    /// Request payload.
    pub payload: serde_json::Value,
    /// Capability configuration.
    pub config: serde_json::Value,
    /// Workflow context; filled in by the execution helper.
    pub metadata: RequestMetadata,
}

/// Spend reported by one node for one capability call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringNodeDetail {
    /// Reporting peer.
    pub peer_id: String,
    /// Unit of the spend, e.g. `COMPUTE` or `GAS.<chain selector>`.
    pub spend_unit: String,
    /// Decimal spend amount.
    pub spend_value: String,
}

/// Capability call response metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Spend reported by every node that served the call.
    pub metering: Vec<MeteringNodeDetail>,
}

/// A response from an executable capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResponse {
    /// Response payload.
    pub payload: serde_json::Value,
    /// Metering and other metadata.
    pub metadata: ResponseMetadata,
}

/// A registration with (or unregistration from) a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRegistrationRequest {
    /// Registration ID, unique per subscription.
    pub trigger_id: String,
    /// Method of the trigger.
    pub method: String,
    /// Subscription payload from the module.
    pub payload: serde_json::Value,
    /// Workflow context.
    pub metadata: RequestMetadata,
}

/// One event delivered by a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Trigger type, e.g. `cron-trigger@1.0.0`.
    pub trigger_type: String,
    /// Event ID, unique per trigger.
    pub id: String,
    /// Event payload handed to the module.
    pub payload: serde_json::Value,
}

/// Item on a trigger's event channel: an event or a delivery error.
pub type TriggerResponse = Result<TriggerEvent, PortsError>;

/// An event source.
#[async_trait]
pub trait TriggerCapability: Send + Sync {
    /// Registry description.
    async fn info(&self) -> Result<CapabilityInfo, PortsError>;

    /// Register and receive the event channel.
    ///
    /// The channel closes when the trigger stops delivering.
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerResponse>, PortsError>;

    /// Undo a registration.
    async fn unregister_trigger(&self, request: TriggerRegistrationRequest) -> Result<(), PortsError>;
}

/// A request/response capability.
#[async_trait]
pub trait ExecutableCapability: Send + Sync {
    /// Registry description.
    async fn info(&self) -> Result<CapabilityInfo, PortsError>;

    /// Execute one request.
    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse, PortsError>;
}

/// Lookup of capabilities and DON topology.
#[async_trait]
pub trait CapabilitiesRegistry: Send + Sync {
    /// The node this engine runs on.
    async fn local_node(&self) -> Result<Node, PortsError>;

    /// Resolve a trigger capability.
    async fn get_trigger(&self, id: &str) -> Result<Arc<dyn TriggerCapability>, PortsError>;

    /// Resolve an executable capability.
    async fn get_executable(&self, id: &str) -> Result<Arc<dyn ExecutableCapability>, PortsError>;

    /// Configuration of `capability_id` on DON `don_id`.
    async fn config_for_capability(
        &self,
        capability_id: &str,
        don_id: u32,
    ) -> Result<CapabilityConfiguration, PortsError>;

    /// Look up another node by peer ID.
    async fn node_by_peer_id(&self, peer_id: &str) -> Result<Node, PortsError>;
}
