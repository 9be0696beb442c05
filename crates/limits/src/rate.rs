//! Scoped GCRA rate limiter built on `governor`.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use donflow_core::{Scope, Tenant};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::debug;

use crate::Limiter;
use crate::error::{LimitError, LimitResult};
use crate::settings::Rate;

fn quota(key: &str, rate: Rate) -> LimitResult<Quota> {
    let per_second = NonZeroU32::new(rate.per_second)
        .ok_or_else(|| LimitError::invalid_setting(key, "rate must be greater than zero"))?;
    let burst = NonZeroU32::new(rate.burst)
        .ok_or_else(|| LimitError::invalid_setting(key, "burst must be greater than zero"))?;
    Ok(Quota::per_second(per_second).allow_burst(burst))
}

/// Admissions between two sweeps of replenished owner buckets.
const PRUNE_INTERVAL: u64 = 1_024;

/// Node-wide bucket layered over one bucket per owner.
///
/// Owner buckets that have fully refilled are swept every
/// [`PRUNE_INTERVAL`] calls to [`ScopedRateLimiter::allow`].
pub struct ScopedRateLimiter {
    global_key: String,
    owner_key: String,
    global: DefaultDirectRateLimiter,
    owners: DefaultKeyedRateLimiter<String>,
    calls: AtomicU64,
}

impl std::fmt::Debug for ScopedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedRateLimiter")
            .field("global_key", &self.global_key)
            .field("owner_key", &self.owner_key)
            .finish()
    }
}

impl ScopedRateLimiter {
    /// Create a limiter from a global and a per-owner rate.
    pub fn new(
        global_key: impl Into<String>,
        global: Rate,
        owner_key: impl Into<String>,
        owner: Rate,
    ) -> LimitResult<Self> {
        let global_key = global_key.into();
        let owner_key = owner_key.into();
        Ok(Self {
            global: RateLimiter::direct(quota(&global_key, global)?),
            owners: RateLimiter::keyed(quota(&owner_key, owner)?),
            calls: AtomicU64::new(0),
            global_key,
            owner_key,
        })
    }

    /// Admit one request for `tenant`, checking the owner bucket first.
    pub fn allow(&self, tenant: &Tenant) -> LimitResult<()> {
        if (self.calls.fetch_add(1, Ordering::Relaxed) + 1).is_multiple_of(PRUNE_INTERVAL) {
            self.prune();
        }
        let owner = tenant.key_for(Scope::Owner);
        if let Err(not_until) = self.owners.check_key(&owner) {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            debug!(key = %self.owner_key, owner = %owner, ?wait, "owner rate limit hit");
            return Err(LimitError::RateLimited {
                key: self.owner_key.clone(),
                scope: Scope::Owner,
                tenant: owner,
            });
        }
        if let Err(not_until) = self.global.check() {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            debug!(key = %self.global_key, ?wait, "global rate limit hit");
            return Err(LimitError::RateLimited {
                key: self.global_key.clone(),
                scope: Scope::Global,
                tenant: String::new(),
            });
        }
        Ok(())
    }

    /// Forget owner buckets that are indistinguishable from fresh ones.
    pub fn prune(&self) {
        self.owners.retain_recent();
        self.owners.shrink_to_fit();
        debug!(key = %self.owner_key, owners = self.owners.len(), "owner rate buckets pruned");
    }

    /// Number of owners with a tracked bucket.
    #[must_use]
    pub fn tracked_owners(&self) -> usize {
        self.owners.len()
    }
}

impl Limiter for ScopedRateLimiter {
    fn key(&self) -> &str {
        &self.global_key
    }

    fn close(&self) -> LimitResult<()> {
        Ok(())
    }
}
