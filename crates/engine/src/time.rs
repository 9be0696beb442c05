//! Time providers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use donflow_core::{Clock, ExecutionId};
use donflow_ports::{DonTimeProvider, PortsError};

/// Serves the node's own clock as DON time.
///
/// For local simulation, where there is no DON to agree with.
#[derive(Clone)]
pub struct LocalTimeProvider {
    clock: Arc<dyn Clock>,
}

impl LocalTimeProvider {
    /// Provider reading `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl std::fmt::Debug for LocalTimeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTimeProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl DonTimeProvider for LocalTimeProvider {
    async fn don_time(&self, _execution_id: &ExecutionId) -> Result<DateTime<Utc>, PortsError> {
        Ok(self.clock.now())
    }
}
