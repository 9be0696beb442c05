#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # donflow Limits
//!
//! Quota enforcement for workflow instances. Every quota is declared once in
//! [`WorkflowSettings`], resolved through [`SettingOverrides`] for a tenant,
//! and handed out by the [`Factory`] as one of five limiter types:
//!
//! - [`BoundLimiter`]: caps a scalar (`check` / `limit`)
//! - [`TimeLimiter`]: bounds a future by a deadline (`run` / `limit`)
//! - [`ResourcePoolLimiter`]: counted semaphore (`wait(n)` returns a release-on-drop permit)
//! - [`QueueLimiter`]: bounded FIFO whose `put` fails fast when full
//! - [`ScopedResourceLimiter`] / [`ScopedRateLimiter`]: global pools and buckets layered over per-owner ones
//!
//! ## Quick Start
//!
//! ```rust
//! use donflow_core::Tenant;
//! use donflow_limits::{Factory, WorkflowSettings};
//!
//! let settings = WorkflowSettings::default();
//! let factory = Factory::default();
//! let bound = factory
//!     .bound(&settings.per_workflow.trigger_subscription_limit, &Tenant::default())
//!     .unwrap();
//! assert!(bound.check(3).is_ok());
//! assert!(bound.check(11).is_err());
//! ```

pub mod bound;
pub mod error;
pub mod factory;
pub mod pool;
pub mod queue;
pub mod rate;
pub mod settings;
pub mod time;

pub use bound::BoundLimiter;
pub use error::{LimitError, LimitResult};
pub use factory::Factory;
pub use pool::{PoolPermit, ResourcePoolLimiter, ScopedPermit, ScopedResourceLimiter};
pub use queue::QueueLimiter;
pub use rate::ScopedRateLimiter;
pub use settings::{HumanDuration, Rate, Setting, SettingOverrides, WorkflowSettings};
pub use time::TimeLimiter;

/// Common surface of every limiter.
pub trait Limiter: Send + Sync {
    /// Setting key the limiter enforces.
    fn key(&self) -> &str;

    /// Release waiters and refuse further use.
    fn close(&self) -> LimitResult<()>;
}

/// Close every limiter, continuing past failures and joining them.
pub fn close_all(limiters: &[&dyn Limiter]) -> LimitResult<()> {
    let errors = limiters
        .iter()
        .filter_map(|limiter| limiter.close().err())
        .collect();
    LimitError::join(errors)
}
