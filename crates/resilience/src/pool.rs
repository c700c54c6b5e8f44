//! Bounded pool of reusable resource handles.
//!
//! Acquisition never waits: when every slot is taken the caller gets
//! [`PoolError::Exhausted`] and is expected to fall back to an unpooled path.

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Errors returned by [`ResourcePool::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool '{name}' exhausted: {max_size} handles in use")]
    Exhausted { name: String, max_size: usize },

    #[error("pool '{name}' failed to create a resource: {message}")]
    Create { name: String, message: String },
}

/// A resource checked out of a [`ResourcePool`].
///
/// Hand it back with [`ResourcePool::release`] for reuse. Dropping it
/// instead destroys the resource and frees its slot.
pub struct Pooled<R> {
    resource: R,
    slot: Slot<R>,
}

impl<R> Pooled<R> {
    pub fn id(&self) -> u64 {
        self.slot.id
    }
}

/// Checked-out slot; frees itself on drop unless disarmed by a release.
struct Slot<R> {
    id: u64,
    state: Weak<Mutex<PoolState<R>>>,
    armed: bool,
}

impl<R> Drop for Slot<R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock();
        if state.in_use.remove(&self.id) {
            state.destroyed_total += 1;
            debug!(id = self.id, "Pooled resource dropped without release");
        }
    }
}

impl<R> Deref for Pooled<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

impl<R> DerefMut for Pooled<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.resource
    }
}

impl<R> fmt::Debug for Pooled<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled").field("id", &self.slot.id).finish()
    }
}

/// Pool occupancy counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub max_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
}

struct IdleEntry<R> {
    id: u64,
    resource: R,
    idle_since: Instant,
}

struct PoolState<R> {
    idle: Vec<IdleEntry<R>>,
    in_use: HashSet<u64>,
    next_id: u64,
    created_total: u64,
    destroyed_total: u64,
}

type Factory<R> = Box<dyn Fn() -> Result<R, String> + Send + Sync>;

/// Bounded pool of reusable handles.
///
/// Invariant: `in_use + idle <= max_size`, and a handle id is never both in
/// use and idle.
pub struct ResourcePool<R> {
    name: String,
    max_size: usize,
    factory: Factory<R>,
    state: Arc<Mutex<PoolState<R>>>,
}

impl<R> ResourcePool<R> {
    /// Create a new pool. `factory` builds a fresh resource on demand.
    pub fn new<F, E>(name: impl Into<String>, max_size: usize, factory: F) -> Self
    where
        F: Fn() -> Result<R, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self {
            name: name.into(),
            max_size,
            factory: Box::new(move || factory().map_err(|e| e.to_string())),
            state: Arc::new(Mutex::new(PoolState {
                idle: Vec::new(),
                in_use: HashSet::new(),
                next_id: 0,
                created_total: 0,
                destroyed_total: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Check out a handle: the most recently idled one, else a new one if
    /// there is room, else [`PoolError::Exhausted`].
    pub fn acquire(&self) -> Result<Pooled<R>, PoolError> {
        let mut state = self.state.lock();

        if let Some(entry) = state.idle.pop() {
            state.in_use.insert(entry.id);
            return Ok(self.checked_out(entry.id, entry.resource));
        }

        if state.in_use.len() + state.idle.len() >= self.max_size {
            return Err(PoolError::Exhausted {
                name: self.name.clone(),
                max_size: self.max_size,
            });
        }

        let resource = (self.factory)().map_err(|message| PoolError::Create {
            name: self.name.clone(),
            message,
        })?;

        let id = state.next_id;
        state.next_id += 1;
        state.created_total += 1;
        state.in_use.insert(id);
        debug!(pool = %self.name, id, "Created pooled resource");

        Ok(self.checked_out(id, resource))
    }

    fn checked_out(&self, id: u64, resource: R) -> Pooled<R> {
        Pooled {
            resource,
            slot: Slot {
                id,
                state: Arc::downgrade(&self.state),
                armed: true,
            },
        }
    }

    /// Return a handle to the idle set.
    ///
    /// Handles that are not currently checked out (e.g. released twice or
    /// released after [`drain`](Self::drain)) are dropped instead.
    pub fn release(&self, handle: Pooled<R>) {
        let Pooled { resource, mut slot } = handle;
        slot.armed = false;

        let mut state = self.state.lock();
        if state.in_use.remove(&slot.id) {
            state.idle.push(IdleEntry {
                id: slot.id,
                resource,
                idle_since: Instant::now(),
            });
        } else {
            debug!(pool = %self.name, id = slot.id, "Ignoring release of unknown handle");
        }
    }

    /// Destroy idle handles that have been idle longer than `older_than`.
    pub fn evict_idle(&self, older_than: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.idle.len();
        state
            .idle
            .retain(|entry| entry.idle_since.elapsed() <= older_than);
        let evicted = before - state.idle.len();
        state.destroyed_total += evicted as u64;
        if evicted > 0 {
            debug!(pool = %self.name, evicted, "Evicted stale idle resources");
        }
        evicted
    }

    /// Destroy every idle handle and forget every checked-out one.
    ///
    /// Returns the number of handles destroyed or forgotten.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let drained = state.idle.len() + state.in_use.len();
        state.idle.clear();
        state.in_use.clear();
        state.destroyed_total += drained as u64;
        info!(pool = %self.name, drained, "Resource pool drained");
        drained
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            max_size: self.max_size,
            in_use: state.in_use.len(),
            idle: state.idle.len(),
            created_total: state.created_total,
            destroyed_total: state.destroyed_total,
        }
    }
}

impl<R> fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(max: usize) -> (ResourcePool<usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let pool = ResourcePool::new("test", max, move || {
            Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst))
        });
        (pool, created)
    }

    #[test]
    fn test_reuses_idle_handle() {
        let (pool, created) = counting_pool(2);

        let first = pool.acquire().unwrap();
        let id = first.id();
        pool.release(first);

        let again = pool.acquire().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhausted_without_blocking() {
        let (pool, _) = counting_pool(2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id(), b.id());

        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { max_size: 2, .. }));

        pool.release(a);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_never_hands_out_held_handle() {
        let (pool, _) = counting_pool(4);
        let mut held: Vec<Pooled<usize>> = Vec::new();
        let mut seen = HashSet::new();

        for round in 0..20 {
            if round % 3 == 2 {
                if let Some(handle) = held.pop() {
                    seen.remove(&handle.id());
                    pool.release(handle);
                }
                continue;
            }
            if let Ok(handle) = pool.acquire() {
                assert!(seen.insert(handle.id()), "handle handed out twice");
                held.push(handle);
            }
            let stats = pool.stats();
            assert!(stats.in_use <= 4);
            assert!(stats.in_use + stats.idle <= 4);
        }
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let (pool, _) = counting_pool(1);
        let handle = pool.acquire().unwrap();
        pool.drain();

        pool.release(handle);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn test_dropped_handle_frees_slot() {
        let (pool, created) = counting_pool(1);

        let handle = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        drop(handle);

        let stats = pool.stats();
        assert_eq!((stats.in_use, stats.idle), (0, 0));
        assert_eq!(stats.destroyed_total, 1);

        // The dropped resource is not reused; a fresh one is created.
        let again = pool.acquire().unwrap();
        assert_eq!(*again, 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handle_outliving_pool() {
        let (pool, _) = counting_pool(1);
        let handle = pool.acquire().unwrap();
        drop(pool);
        drop(handle);
    }

    #[test]
    fn test_drain_clears_both_sets() {
        let (pool, _) = counting_pool(3);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        pool.release(a);

        assert_eq!(pool.drain(), 2);
        let stats = pool.stats();
        assert_eq!((stats.in_use, stats.idle), (0, 0));
        assert_eq!(stats.destroyed_total, 2);
    }

    #[test]
    fn test_factory_error() {
        let pool: ResourcePool<u8> = ResourcePool::new("broken", 1, || Err("no route"));
        let err = pool.acquire().unwrap_err();
        assert_eq!(
            err,
            PoolError::Create {
                name: "broken".to_string(),
                message: "no route".to_string()
            }
        );
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle() {
        let (pool, _) = counting_pool(3);
        let old = pool.acquire().unwrap();
        let fresh = pool.acquire().unwrap();
        pool.release(old);

        tokio::time::advance(Duration::from_secs(120)).await;
        pool.release(fresh);

        assert_eq!(pool.evict_idle(Duration::from_secs(60)), 1);
        assert_eq!(pool.stats().idle, 1);
    }
}
