#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # donflow Core
//!
//! Fundamental building blocks shared by every donflow crate.
//!
//! ## Key Components
//!
//! - **Identifiers**: [`WorkflowId`], [`WorkflowOwner`], [`ExecutionId`]
//! - **Scopes**: [`Scope`] and [`Tenant`] for the global → owner → workflow quota hierarchy
//! - **Clocks**: [`Clock`] with the wall-clock [`SystemClock`] and the test-friendly [`ManualClock`]
//!
//! ## Usage
//!
//! ```rust
//! use donflow_core::{ExecutionId, WorkflowId};
//!
//! let workflow_id: WorkflowId =
//!     "1111111111111111111111111111111111111111111111111111111111111111".parse().unwrap();
//! let execution_id = ExecutionId::derive(&workflow_id, "event-1");
//! assert_eq!(execution_id.as_str().len(), 64);
//! ```

pub mod clock;
pub mod error;
pub mod id;
pub mod scope;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{ExecutionId, WorkflowId, WorkflowOwner};
pub use scope::{Scope, Tenant};
