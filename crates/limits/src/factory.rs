//! Limiter factory.
//!
//! Resolves a [`Setting`] against the operator [`SettingOverrides`] for one
//! [`Tenant`] and wraps the value in the matching limiter type. Invalid values
//! (zero-sized pools and queues, pools larger than a semaphore can count) fail
//! here, before any limiter is handed out.

use std::time::Duration;

use donflow_core::Tenant;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::bound::BoundLimiter;
use crate::error::{LimitError, LimitResult};
use crate::pool::{ResourcePoolLimiter, ScopedResourceLimiter};
use crate::queue::QueueLimiter;
use crate::rate::ScopedRateLimiter;
use crate::settings::{HumanDuration, Rate, Setting, SettingOverrides};
use crate::time::TimeLimiter;

/// Builds limiters from settings.
#[derive(Debug, Clone, Default)]
pub struct Factory {
    overrides: SettingOverrides,
}

impl Factory {
    /// Create a factory applying `overrides` on top of setting defaults.
    #[must_use]
    pub fn new(overrides: SettingOverrides) -> Self {
        Self { overrides }
    }

    /// Effective value of `setting` for `tenant`.
    pub fn resolve<T>(&self, setting: &Setting<T>, tenant: &Tenant) -> LimitResult<T>
    where
        T: DeserializeOwned + Clone,
    {
        self.overrides.resolve(setting, tenant)
    }

    fn positive(setting: &Setting<u64>, value: u64) -> LimitResult<u64> {
        if value == 0 {
            return Err(LimitError::invalid_setting(&setting.key, "must be greater than zero"));
        }
        Ok(value)
    }

    fn pool_size(setting: &Setting<u64>, value: u64) -> LimitResult<u64> {
        let value = Self::positive(setting, value)?;
        if usize::try_from(value).map_or(true, |units| units > Semaphore::MAX_PERMITS) {
            return Err(LimitError::invalid_setting(
                &setting.key,
                format!("pool size must not exceed {}", Semaphore::MAX_PERMITS),
            ));
        }
        Ok(value)
    }

    /// Build a bound limiter.
    pub fn bound(&self, setting: &Setting<u64>, tenant: &Tenant) -> LimitResult<BoundLimiter> {
        let limit = self.resolve(setting, tenant)?;
        debug!(key = %setting.key, limit, "bound limiter");
        Ok(BoundLimiter::new(
            &setting.key,
            setting.scope,
            tenant.key_for(setting.scope),
            limit,
        ))
    }

    /// Build a time limiter.
    pub fn time(&self, setting: &Setting<HumanDuration>, tenant: &Tenant) -> LimitResult<TimeLimiter> {
        let limit: Duration = self.resolve(setting, tenant)?.get();
        if limit.is_zero() {
            return Err(LimitError::invalid_setting(&setting.key, "timeout must be greater than zero"));
        }
        debug!(key = %setting.key, ?limit, "time limiter");
        Ok(TimeLimiter::new(&setting.key, limit))
    }

    /// Build a resource-pool limiter.
    pub fn resource_pool(
        &self,
        setting: &Setting<u64>,
        tenant: &Tenant,
    ) -> LimitResult<ResourcePoolLimiter> {
        let limit = Self::pool_size(setting, self.resolve(setting, tenant)?)?;
        debug!(key = %setting.key, limit, "resource pool limiter");
        Ok(ResourcePoolLimiter::new(
            &setting.key,
            setting.scope,
            tenant.key_for(setting.scope),
            limit,
        ))
    }

    /// Build a queue limiter.
    pub fn queue<T>(&self, setting: &Setting<u64>, tenant: &Tenant) -> LimitResult<QueueLimiter<T>> {
        let capacity = Self::positive(setting, self.resolve(setting, tenant)?)?;
        let capacity = usize::try_from(capacity)
            .map_err(|e| LimitError::invalid_setting(&setting.key, e.to_string()))?;
        debug!(key = %setting.key, capacity, "queue limiter");
        Ok(QueueLimiter::new(&setting.key, capacity))
    }

    /// Build a global pool layered over per-owner pools.
    pub fn scoped_resource_pool(
        &self,
        global: &Setting<u64>,
        per_owner: &Setting<u64>,
    ) -> LimitResult<ScopedResourceLimiter> {
        let tenant = Tenant::default();
        let global_limit = Self::pool_size(global, self.resolve(global, &tenant)?)?;
        let owner_limit = Self::pool_size(per_owner, self.resolve(per_owner, &tenant)?)?;
        Ok(ScopedResourceLimiter::new(
            &global.key,
            global_limit,
            &per_owner.key,
            owner_limit,
        ))
    }

    /// Build a global rate limiter layered over per-owner buckets.
    pub fn scoped_rate(
        &self,
        global: &Setting<Rate>,
        per_owner: &Setting<Rate>,
    ) -> LimitResult<ScopedRateLimiter> {
        let tenant = Tenant::default();
        ScopedRateLimiter::new(
            &global.key,
            self.resolve(global, &tenant)?,
            &per_owner.key,
            self.resolve(per_owner, &tenant)?,
        )
    }
}
