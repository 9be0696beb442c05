//! Time limiter: bounds a future by a deadline.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::Limiter;
use crate::error::{LimitError, LimitResult};

/// Runs futures under a fixed deadline.
#[derive(Debug, Clone)]
pub struct TimeLimiter {
    key: String,
    limit: Duration,
}

impl TimeLimiter {
    /// Create a limiter enforcing `limit`.
    pub fn new(key: impl Into<String>, limit: Duration) -> Self {
        Self {
            key: key.into(),
            limit,
        }
    }

    /// The configured deadline.
    #[must_use]
    pub const fn limit(&self) -> Duration {
        self.limit
    }

    /// Run `fut`, failing with [`LimitError::Timeout`] once the deadline passes.
    ///
    /// The future is dropped on expiry, which cancels whatever it was awaiting.
    pub async fn run<F>(&self, fut: F) -> LimitResult<F::Output>
    where
        F: Future,
    {
        tokio::time::timeout(self.limit, fut).await.map_err(|_| {
            debug!(key = %self.key, limit = ?self.limit, "deadline exceeded");
            LimitError::timeout(&self.key, self.limit)
        })
    }
}

impl Limiter for TimeLimiter {
    fn key(&self) -> &str {
        &self.key
    }

    fn close(&self) -> LimitResult<()> {
        Ok(())
    }
}
