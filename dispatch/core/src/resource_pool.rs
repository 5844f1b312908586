//! Resource Pool
//!
//! Generic bounded pool for scarce local resources with a setup cost
//! (sandboxed execution contexts, browser sessions, scratch directories).
//! Resources are created once and reused across jobs.
//!
//! # Fairness
//!
//! Waiters queue on a tokio `Semaphore`, which grants permits in request
//! order, so the pool is FIFO. A permit is only issued while at least one
//! slot is idle, so a permit holder always finds a resource.
//!
//! # Leases
//!
//! `acquire` returns a [`Lease`]. Dropping the lease (or passing it to
//! [`ResourcePool::release`]) puts the resource back before the permit is
//! returned, so the next waiter always sees an idle slot. A lease dropped by
//! a timed-out or cancelled job is therefore released as well.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::job::JobId;

// ============================================================================
// Errors
// ============================================================================

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Pool was drained or shut down
    #[error("resource pool is closed")]
    Closed,

    /// A permit was granted but no slot was idle
    #[error("resource pool bookkeeping is inconsistent: no idle slot for a granted permit")]
    Inconsistent,
}

// ============================================================================
// Pool
// ============================================================================

struct Slot<R> {
    /// `None` while leased out
    resource: Option<R>,
    holder: Option<JobId>,
}

struct PoolInner<R> {
    slots: Mutex<Vec<Slot<R>>>,
    semaphore: Arc<Semaphore>,
    size: usize,
    total_leases: AtomicU64,
}

/// Bounded FIFO pool of leasable resources
///
/// Cheap to clone; clones share the same slots.
pub struct ResourcePool<R> {
    inner: Arc<PoolInner<R>>,
}

impl<R> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Send + 'static> ResourcePool<R> {
    /// Create a pool owning the given resources
    pub fn new(resources: Vec<R>) -> Self {
        let size = resources.len();
        let slots = resources
            .into_iter()
            .map(|r| Slot {
                resource: Some(r),
                holder: None,
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(slots),
                semaphore: Arc::new(Semaphore::new(size)),
                size,
                total_leases: AtomicU64::new(0),
            }),
        }
    }

    /// Create a pool of `size` resources built by `factory(slot_index)`
    pub fn with_factory(size: usize, factory: impl FnMut(usize) -> R) -> Self {
        Self::new((0..size).map(factory).collect())
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Wait (FIFO) until a resource is idle and lease it to `holder`
    pub async fn acquire(&self, holder: &JobId) -> Result<Lease<R>, PoolError> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        self.checkout(holder, permit)
    }

    /// Lease a resource only if one is idle right now
    pub fn try_acquire(&self, holder: &JobId) -> Result<Option<Lease<R>>, PoolError> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => self.checkout(holder, permit).map(Some),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(PoolError::Closed),
        }
    }

    /// Return a lease explicitly; equivalent to dropping it
    pub fn release(&self, lease: Lease<R>) {
        drop(lease);
    }

    fn checkout(&self, holder: &JobId, permit: OwnedSemaphorePermit) -> Result<Lease<R>, PoolError> {
        let mut slots = self.inner.slots.lock();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.resource.is_some())
            .ok_or(PoolError::Inconsistent)?;

        let resource = slot.resource.take();
        slot.holder = Some(holder.clone());
        self.inner.total_leases.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(slot = index, holder = %holder, "Resource leased");

        Ok(Lease {
            pool: Arc::clone(&self.inner),
            index,
            resource,
            permit: Some(permit),
        })
    }

    /// Current holder of a slot
    #[must_use]
    pub fn holder(&self, index: usize) -> Option<JobId> {
        self.inner
            .slots
            .lock()
            .get(index)
            .and_then(|slot| slot.holder.clone())
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let slots = self.inner.slots.lock();
        let busy = slots.iter().filter(|s| s.resource.is_none()).count();
        PoolStats {
            size: self.inner.size,
            busy,
            idle: self.inner.size - busy,
            total_leases: self.inner.total_leases.load(Ordering::Relaxed),
        }
    }

    /// Wait for every lease to come back, close the pool, and hand the
    /// resources back for teardown
    pub async fn drain(&self) -> Result<Vec<R>, PoolError> {
        let permits = u32::try_from(self.inner.size).map_err(|_| PoolError::Inconsistent)?;
        let all = Arc::clone(&self.inner.semaphore)
            .acquire_many_owned(permits)
            .await
            .map_err(|_| PoolError::Closed)?;
        self.inner.semaphore.close();

        let resources = self
            .inner
            .slots
            .lock()
            .iter_mut()
            .filter_map(|slot| slot.resource.take())
            .collect();
        drop(all);

        tracing::debug!(size = self.inner.size, "Resource pool drained");
        Ok(resources)
    }
}

/// Pool occupancy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub busy: usize,
    pub idle: usize,
    pub total_leases: u64,
}

// ============================================================================
// Lease
// ============================================================================

/// Exclusive handle to a pooled resource
pub struct Lease<R> {
    pool: Arc<PoolInner<R>>,
    index: usize,
    resource: Option<R>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<R> Lease<R> {
    /// Slot index of the leased resource
    #[must_use]
    pub fn slot(&self) -> usize {
        self.index
    }
}

impl<R> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        // Only `Drop` takes the resource out
        self.resource
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease resource taken before drop"))
    }
}

impl<R> DerefMut for Lease<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease resource taken before drop"))
    }
}

impl<R> Drop for Lease<R> {
    fn drop(&mut self) {
        {
            let mut slots = self.pool.slots.lock();
            if let Some(slot) = slots.get_mut(self.index) {
                slot.resource = self.resource.take();
                slot.holder = None;
            }
        }
        // Resource is back in its slot before the next waiter is woken
        drop(self.permit.take());
    }
}

impl<R: std::fmt::Debug> std::fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("slot", &self.index)
            .field("resource", &self.resource)
            .finish()
    }
}

// ============================================================================
// Execution Context
// ============================================================================

/// Isolated local execution context leased by stages that need one
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionContext {
    pub label: String,

    /// Jobs served since creation
    pub uses: u64,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            label: format!("sandbox-{index}"),
            uses: 0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn pool(size: usize) -> ResourcePool<ExecutionContext> {
        ResourcePool::with_factory(size, ExecutionContext::new)
    }

    #[tokio::test]
    async fn test_acquire_marks_busy_with_holder() {
        let pool = pool(2);
        let job = JobId::new("j1");

        let mut lease = pool.acquire(&job).await.unwrap();
        lease.uses += 1;
        assert_eq!(pool.stats().busy, 1);
        assert_eq!(pool.holder(lease.slot()), Some(job));

        pool.release(lease);
        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.total_leases, 1);
        assert_eq!(pool.holder(0), None);
    }

    #[tokio::test]
    async fn test_resource_state_survives_lease() {
        let pool = pool(1);
        {
            let mut lease = pool.acquire(&JobId::new("a")).await.unwrap();
            lease.uses += 1;
        }
        let lease = pool.acquire(&JobId::new("b")).await.unwrap();
        assert_eq!(lease.uses, 1);
        assert_eq!(lease.label, "sandbox-0");
    }

    #[tokio::test]
    async fn test_try_acquire_when_exhausted() {
        let pool = pool(1);
        let held = pool.try_acquire(&JobId::new("a")).unwrap();
        assert!(held.is_some());
        assert!(pool.try_acquire(&JobId::new("b")).unwrap().is_none());
        drop(held);
        assert!(pool.try_acquire(&JobId::new("b")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let pool = pool(1);
        let held = pool.acquire(&JobId::new("a")).await.unwrap();

        let other = JobId::new("b");
        let mut waiter = task::spawn(pool.acquire(&other));
        assert_pending!(waiter.poll());

        drop(held);
        assert!(waiter.is_woken());
        let lease = assert_ready_ok!(waiter.poll());
        assert_eq!(pool.holder(lease.slot()), Some(other.clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_fifo() {
        let pool = pool(1);
        let held = pool.acquire(&JobId::new("first")).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let pool = pool.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire(&JobId::new(format!("w{i}"))).await.unwrap();
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(lease);
            }));
            // Let each waiter enqueue before the next one
            tokio::task::yield_now().await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_outstanding_leases() {
        let pool = pool(2);
        let lease = pool.acquire(&JobId::new("a")).await.unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(lease);
        });

        let resources = pool.drain().await.unwrap();
        releaser.await.unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(
            pool.acquire(&JobId::new("late")).await.unwrap_err(),
            PoolError::Closed
        );
    }
}
