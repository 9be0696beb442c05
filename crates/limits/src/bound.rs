//! Bound limiter: caps a scalar quantity.

use donflow_core::Scope;

use crate::Limiter;
use crate::error::{LimitError, LimitResult};

/// Caps a scalar such as a subscription count or a log line length.
#[derive(Debug, Clone)]
pub struct BoundLimiter {
    key: String,
    scope: Scope,
    tenant: String,
    limit: u64,
}

impl BoundLimiter {
    /// Create a bound for `key` at `scope`.
    pub fn new(key: impl Into<String>, scope: Scope, tenant: impl Into<String>, limit: u64) -> Self {
        Self {
            key: key.into(),
            scope,
            tenant: tenant.into(),
            limit,
        }
    }

    /// The configured bound.
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Fail with [`LimitError::BoundExceeded`] if `amount` is over the bound.
    pub fn check(&self, amount: u64) -> LimitResult<()> {
        if amount > self.limit {
            return Err(LimitError::BoundExceeded {
                key: self.key.clone(),
                scope: self.scope,
                tenant: self.tenant.clone(),
                limit: self.limit,
                amount,
            });
        }
        Ok(())
    }
}

impl Limiter for BoundLimiter {
    fn key(&self) -> &str {
        &self.key
    }

    fn close(&self) -> LimitResult<()> {
        Ok(())
    }
}
