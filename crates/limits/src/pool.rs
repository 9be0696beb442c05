//! Resource-pool limiters: counted semaphores handing out release-on-drop permits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use donflow_core::{Scope, Tenant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::Limiter;
use crate::error::{LimitError, LimitResult};

/// Units held from a pool. Dropping the permit returns them.
#[derive(Debug)]
pub struct PoolPermit {
    permit: OwnedSemaphorePermit,
}

impl PoolPermit {
    /// Number of units held.
    #[must_use]
    pub fn units(&self) -> usize {
        self.permit.num_permits()
    }

    /// Return the units now, e.g. on an error path.
    pub fn free(self) {
        drop(self.permit);
    }
}

/// A counted semaphore of `limit` units.
#[derive(Debug)]
pub struct ResourcePoolLimiter {
    key: String,
    scope: Scope,
    tenant: String,
    limit: u64,
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
}

impl ResourcePoolLimiter {
    /// Create a pool of `limit` units, capped at [`Semaphore::MAX_PERMITS`].
    pub fn new(key: impl Into<String>, scope: Scope, tenant: impl Into<String>, limit: u64) -> Self {
        let units = usize::try_from(limit).map_or(Semaphore::MAX_PERMITS, |units| {
            units.min(Semaphore::MAX_PERMITS)
        });
        Self {
            key: key.into(),
            scope,
            tenant: tenant.into(),
            limit: units as u64,
            semaphore: Arc::new(Semaphore::new(units)),
            closed: AtomicBool::new(false),
        }
    }

    /// Pool size.
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Units currently free.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.semaphore.available_permits() as u64
    }

    fn exhausted(&self) -> LimitError {
        LimitError::ResourceExhausted {
            key: self.key.clone(),
            scope: self.scope,
            tenant: self.tenant.clone(),
            limit: self.limit,
        }
    }

    /// Wait until `units` are free and take them.
    ///
    /// Cancel-safe: dropping the future before it resolves takes nothing.
    pub async fn wait(&self, units: u32) -> LimitResult<PoolPermit> {
        if u64::from(units) > self.limit {
            return Err(self.exhausted());
        }
        let permit = Arc::clone(&self.semaphore)
            .acquire_many_owned(units)
            .await
            .map_err(|_| LimitError::closed(&self.key))?;
        Ok(PoolPermit { permit })
    }

    /// Take `units` if they are free right now.
    pub fn try_wait(&self, units: u32) -> LimitResult<PoolPermit> {
        match Arc::clone(&self.semaphore).try_acquire_many_owned(units) {
            Ok(permit) => Ok(PoolPermit { permit }),
            Err(TryAcquireError::NoPermits) => {
                debug!(key = %self.key, scope = %self.scope, tenant = %self.tenant, "resource pool exhausted");
                Err(self.exhausted())
            }
            Err(TryAcquireError::Closed) => Err(LimitError::closed(&self.key)),
        }
    }
}

impl Limiter for ResourcePoolLimiter {
    fn key(&self) -> &str {
        &self.key
    }

    /// Wake every waiter with [`LimitError::Closed`]. Closing twice is an error.
    fn close(&self) -> LimitResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(LimitError::closed(&self.key));
        }
        self.semaphore.close();
        Ok(())
    }
}

type OwnerPools = DashMap<String, Arc<ResourcePoolLimiter>>;

/// Units held from both the per-owner and the global pool.
///
/// Dropping the permit returns the units and forgets the owner's pool once
/// nothing holds or references it.
#[derive(Debug)]
pub struct ScopedPermit {
    owner: Option<PoolPermit>,
    _global: PoolPermit,
    owner_id: String,
    owners: Arc<OwnerPools>,
}

impl ScopedPermit {
    /// Return the units to both pools.
    pub fn free(self) {
        drop(self);
    }
}

impl Drop for ScopedPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.owner.take() {
            permit.free();
        }
        evict_idle(&self.owners, &self.owner_id);
    }
}

/// Forget `owner`'s pool if no permit holds units from it and no caller is
/// about to take some.
fn evict_idle(owners: &OwnerPools, owner: &str) {
    let evicted = owners.remove_if(owner, |_, pool| {
        Arc::strong_count(pool) == 1 && pool.available() == pool.limit()
    });
    if evicted.is_some() {
        debug!(owner, "idle owner pool evicted");
    }
}

/// A global pool layered over one pool per owner.
///
/// A request must fit both its owner's pool and the global pool; the
/// rejection names the scope that ran out. Owner pools are created on first
/// use and dropped again when their last permit is released.
#[derive(Debug)]
pub struct ScopedResourceLimiter {
    global: ResourcePoolLimiter,
    owner_key: String,
    owner_limit: u64,
    owners: Arc<OwnerPools>,
}

impl ScopedResourceLimiter {
    /// Create a limiter with `global_limit` units overall and `owner_limit` per owner.
    pub fn new(
        global_key: impl Into<String>,
        global_limit: u64,
        owner_key: impl Into<String>,
        owner_limit: u64,
    ) -> Self {
        Self {
            global: ResourcePoolLimiter::new(global_key, Scope::Global, "", global_limit),
            owner_key: owner_key.into(),
            owner_limit: owner_limit.min(Semaphore::MAX_PERMITS as u64),
            owners: Arc::default(),
        }
    }

    /// The pool of `owner`, created on first use.
    fn owner_pool(&self, owner: &str) -> Arc<ResourcePoolLimiter> {
        self.owners
            .entry(owner.to_owned())
            .or_insert_with(|| {
                Arc::new(ResourcePoolLimiter::new(
                    &self.owner_key,
                    Scope::Owner,
                    owner,
                    self.owner_limit,
                ))
            })
            .clone()
    }

    /// Take `units` for `tenant` without waiting.
    ///
    /// Fails with a [`Scope::Owner`] rejection when the owner's pool is full
    /// and a [`Scope::Global`] rejection when the node-wide pool is full.
    pub fn try_use(&self, tenant: &Tenant, units: u32) -> LimitResult<ScopedPermit> {
        let owner_id = tenant.key_for(Scope::Owner);
        let pool = self.owner_pool(&owner_id);
        let taken = pool
            .try_wait(units)
            .and_then(|owner| self.global.try_wait(units).map(|global| (owner, global)));
        drop(pool);
        match taken {
            Ok((owner, global)) => Ok(ScopedPermit {
                owner: Some(owner),
                _global: global,
                owner_id,
                owners: Arc::clone(&self.owners),
            }),
            Err(e) => {
                evict_idle(&self.owners, &owner_id);
                Err(e)
            }
        }
    }

    /// Units free for `tenant` at `scope`.
    #[must_use]
    pub fn available(&self, scope: Scope, tenant: &Tenant) -> u64 {
        match scope {
            Scope::Global => self.global.available(),
            _ => self
                .owners
                .get(&tenant.key_for(Scope::Owner))
                .map_or(self.owner_limit, |pool| pool.available()),
        }
    }

    /// Number of owners with a live pool.
    #[must_use]
    pub fn tracked_owners(&self) -> usize {
        self.owners.len()
    }
}

impl Limiter for ScopedResourceLimiter {
    fn key(&self) -> &str {
        self.global.key()
    }

    fn close(&self) -> LimitResult<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.global.close() {
            errors.push(e);
        }
        for pool in self.owners.iter() {
            if let Err(e) = pool.close() {
                errors.push(e);
            }
        }
        LimitError::join(errors)
    }
}
