#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # donflow Ports
//!
//! Interfaces of the collaborators the execution core talks to.
//!
//! - [`Module`] -- the sandboxed workflow program
//! - [`CapabilitiesRegistry`], [`TriggerCapability`], [`ExecutableCapability`] -- capability lookup and calls
//! - [`ExecutionHelper`] -- services the module calls back into during a run
//! - [`SecretsFetcher`] -- batch secret resolution
//! - [`OrgResolver`], [`DonTimeProvider`] -- billing organization and DON time lookups
//!
//! All traits are `async_trait` and object-safe, suitable for use as
//! `Arc<dyn Trait>` behind dependency injection.

pub mod capability;
pub mod error;
pub mod helper;
pub mod module;
pub mod secrets;

pub use capability::{
    CapabilitiesRegistry, CapabilityConfiguration, CapabilityInfo, CapabilityRequest,
    CapabilityResponse, CapabilityType, Don, ExecutableCapability, MeteringNodeDetail, Node,
    RequestMetadata, ResponseMetadata, TriggerCapability, TriggerEvent,
    TriggerRegistrationRequest, TriggerResponse,
};
pub use error::PortsError;
pub use helper::{DonTimeProvider, ExecutionHelper, OrgResolver};
pub use module::{ExecuteRequest, ExecutionResult, Module, RequestKind, TriggerSubscription};
pub use secrets::{DEFAULT_NAMESPACE, GetSecretsRequest, SecretRequest, SecretResponse, SecretsFetcher};
