//! # Resource pool
//!
//! A generic pool of reusable resources (normally [`Connection`]s) with a
//! background sweeper evicting idle ones.
//!
//! Idle entries live in a double-ended queue: returning a [`Pooled`] guard
//! pushes to the head and [`acquire`](ResourcePool::acquire) pops from the
//! head, so the tail always holds the entry returned longest ago. The sweeper
//! only looks at the tail and stops at the first entry that is still fresh.
//!
//! The pool never waits for capacity: a miss creates a new resource through
//! the [`ManageResource`] implementation.
//!
//! [`Connection`]: crate::core::connection::Connection

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::proto::error::{Error, Result};

mod manager;

pub use manager::ConnectionManager;

/// Creates, validates and destroys pooled resources.
pub trait ManageResource: Send + Sync + 'static {
    /// The pooled resource.
    type Resource: Send + 'static;

    /// Creates a new resource.
    fn create(&self) -> BoxFuture<'_, Result<Self::Resource>>;

    /// Cheap, synchronous validity check run on acquire and release.
    fn is_valid(&self, resource: &Self::Resource) -> bool;

    /// Liveness check run by the sweeper when `test_while_idle` is set.
    fn check_health<'a>(&'a self, resource: &'a mut Self::Resource) -> BoxFuture<'a, bool>;

    /// Disposes of a resource. Dropping it is enough for sockets.
    fn destroy(&self, resource: Self::Resource) {
        drop(resource);
    }
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle entries older than this are evicted by the sweeper.
    pub idle_timeout: Duration,
    /// Delay between sweeper rounds. `None` disables the sweeper.
    pub sweep_interval: Option<Duration>,
    /// Probe idle resources with [`ManageResource::check_health`] while
    /// sweeping.
    pub test_while_idle: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Some(Duration::from_secs(30)),
            test_while_idle: true,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Resources created since the pool was built.
    pub created: u64,
    /// Resources destroyed since the pool was built.
    pub destroyed: u64,
    /// Resources currently held by callers.
    pub borrowed: usize,
    /// Resources currently idle in the pool.
    pub idle: usize,
}

struct PooledEntry<T> {
    resource: T,
    returned_at: Instant,
}

struct PoolInner<M: ManageResource> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<PooledEntry<M::Resource>>>,
    closed: AtomicBool,
    created: AtomicU64,
    destroyed: AtomicU64,
    borrowed: AtomicUsize,
    shutdown: Notify,
}

impl<M: ManageResource> PoolInner<M> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<PooledEntry<M::Resource>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn destroy(&self, resource: M::Resource) {
        self.manager.destroy(resource);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// One sweeper round. Returns the number of evicted resources.
    async fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        loop {
            let popped = self.idle().pop_back();
            let Some(mut entry) = popped else {
                break;
            };

            let fresh = entry.returned_at.elapsed() <= self.config.idle_timeout
                && self.manager.is_valid(&entry.resource)
                && (!self.config.test_while_idle
                    || self.manager.check_health(&mut entry.resource).await);

            if !fresh {
                self.destroy(entry.resource);
                evicted += 1;
                continue;
            }

            if self.closed.load(Ordering::Acquire) {
                // the pool was closed while this entry was out of the queue
                self.destroy(entry.resource);
            } else {
                self.idle().push_back(entry);
            }
            break;
        }

        if evicted > 0 {
            debug!(evicted, "evicted idle resources");
        }
        evicted
    }
}

/// A cloneable handle to a pool of resources managed by `M`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use shardis::core::config::TcpConnectionFactory;
/// use shardis::pool::{ConnectionManager, PoolConfig, ResourcePool};
///
/// # async fn example() -> shardis::Result<()> {
/// let factory = Arc::new(TcpConnectionFactory::default());
/// let pool = ResourcePool::new(
///     ConnectionManager::new("127.0.0.1:6379", factory),
///     PoolConfig::default(),
/// );
/// let mut conn = pool.acquire().await?;
/// conn.ping().await?;
/// // dropping the guard returns the connection
/// # Ok(())
/// # }
/// ```
pub struct ResourcePool<M: ManageResource> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageResource> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ManageResource> ResourcePool<M> {
    /// Creates a pool and starts its sweeper.
    ///
    /// The sweeper is a tokio task; outside a runtime the pool is created
    /// without one.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let sweep_interval = config.sweep_interval;
        let inner = Arc::new(PoolInner {
            manager,
            config,
            idle: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            borrowed: AtomicUsize::new(0),
            shutdown: Notify::new(),
        });

        if let Some(interval) = sweep_interval {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(sweep(Arc::downgrade(&inner), interval));
                }
                Err(_) => warn!("no tokio runtime, idle sweeper disabled"),
            }
        }

        Self { inner }
    }

    /// Takes an idle resource, or creates one when none is available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] after [`close`](ResourcePool::close) and
    /// [`Error::ResourceCreation`] when the manager fails to create a
    /// resource.
    pub async fn acquire(&self) -> Result<Pooled<M>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        loop {
            let popped = self.inner.idle().pop_front();
            let Some(entry) = popped else {
                break;
            };
            if self.inner.manager.is_valid(&entry.resource) {
                self.inner.borrowed.fetch_add(1, Ordering::Relaxed);
                return Ok(self.guard(entry.resource));
            }
            self.inner.destroy(entry.resource);
        }

        let resource = self
            .inner
            .manager
            .create()
            .await
            .map_err(|e| Error::ResourceCreation {
                source: Box::new(e),
            })?;
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        self.inner.borrowed.fetch_add(1, Ordering::Relaxed);
        Ok(self.guard(resource))
    }

    /// Returns a resource to the head of the pool.
    ///
    /// Invalid resources are destroyed instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] if the pool no longer accepts resources;
    /// the resource is destroyed.
    pub(crate) fn release(&self, resource: M::Resource) -> Result<()> {
        self.returned();

        if self.is_closed() {
            self.inner.destroy(resource);
            error!("resource returned to a closed pool");
            return Err(Error::PoolClosed);
        }

        if !self.inner.manager.is_valid(&resource) {
            self.inner.destroy(resource);
            return Ok(());
        }

        self.inner.idle().push_front(PooledEntry {
            resource,
            returned_at: Instant::now(),
        });
        Ok(())
    }

    /// Destroys a resource known to be unusable, skipping validation.
    pub(crate) fn release_broken(&self, resource: M::Resource) {
        self.returned();
        self.inner.destroy(resource);
    }

    /// Runs one sweeper round immediately.
    pub async fn evict_idle(&self) -> usize {
        self.inner.evict_idle().await
    }

    /// Stops the sweeper and destroys every idle resource.
    ///
    /// Resources still borrowed are destroyed when they come back.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.notify_one();

        let drained: Vec<_> = self.inner.idle().drain(..).collect();
        let count = drained.len();
        for entry in drained {
            self.inner.destroy(entry.resource);
        }
        debug!(destroyed = count, "pool closed");
    }

    /// Returns true after [`close`](ResourcePool::close).
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            borrowed: self.inner.borrowed.load(Ordering::Relaxed),
            idle: self.inner.idle().len(),
        }
    }

    /// The resource manager.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    fn returned(&self) {
        // never below zero
        let _ = self
            .inner
            .borrowed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn guard(&self, resource: M::Resource) -> Pooled<M> {
        Pooled {
            resource: Some(resource),
            pool: self.clone(),
        }
    }
}

impl<M: ManageResource> fmt::Debug for ResourcePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn sweep<M: ManageResource>(pool: Weak<PoolInner<M>>, interval: Duration) {
    loop {
        let shutdown = match pool.upgrade() {
            Some(inner) => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => false,
                    _ = inner.shutdown.notified() => true,
                }
            }
            None => return,
        };
        if shutdown {
            return;
        }

        let Some(inner) = pool.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        inner.evict_idle().await;
    }
}

/// A borrowed resource. Dropping the guard returns it to the pool.
pub struct Pooled<M: ManageResource> {
    resource: Option<M::Resource>,
    pool: ResourcePool<M>,
}

impl<M: ManageResource> Pooled<M> {
    /// Returns the resource to the pool, reporting a closed pool.
    pub fn release(mut self) -> Result<()> {
        match self.resource.take() {
            Some(resource) => self.pool.release(resource),
            None => Ok(()),
        }
    }

    /// Destroys the resource instead of returning it.
    pub fn release_broken(mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release_broken(resource);
        }
    }
}

impl<M: ManageResource> Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        // only taken by release, release_broken and drop, which consume the guard
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource accessed after release"),
        }
    }
}

impl<M: ManageResource> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource accessed after release"),
        }
    }
}

impl<M: ManageResource> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            // a closed pool already logged and destroyed the resource
            let _ = self.pool.release(resource);
        }
    }
}

impl<M: ManageResource> fmt::Debug for Pooled<M>
where
    M::Resource: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("resource", &self.resource)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;

    use super::*;

    /// Hands out numbered resources; ids in `bad` fail validation.
    #[derive(Default)]
    struct Counter {
        next: AtomicU32,
        bad: Mutex<HashSet<u32>>,
        unhealthy: Mutex<HashSet<u32>>,
        fail_create: AtomicBool,
        destroyed: Mutex<Vec<u32>>,
    }

    impl ManageResource for Arc<Counter> {
        type Resource = u32;

        fn create(&self) -> BoxFuture<'_, Result<u32>> {
            Box::pin(async move {
                if self.fail_create.load(Ordering::SeqCst) {
                    return Err(Error::ConnectionClosed);
                }
                Ok(self.next.fetch_add(1, Ordering::SeqCst))
            })
        }

        fn is_valid(&self, resource: &u32) -> bool {
            !self.bad.lock().unwrap().contains(resource)
        }

        fn check_health<'a>(&'a self, resource: &'a mut u32) -> BoxFuture<'a, bool> {
            let healthy = !self.unhealthy.lock().unwrap().contains(resource);
            Box::pin(async move { healthy })
        }

        fn destroy(&self, resource: u32) {
            self.destroyed.lock().unwrap().push(resource);
        }
    }

    fn pool(config: PoolConfig) -> (ResourcePool<Arc<Counter>>, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        (ResourcePool::new(Arc::clone(&counter), config), counter)
    }

    fn manual() -> PoolConfig {
        PoolConfig {
            idle_timeout: Duration::from_millis(100),
            sweep_interval: None,
            test_while_idle: true,
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_on_miss_and_reuses_head() {
        let (pool, _) = pool(manual());
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(*a, *b);
        let b_id = *b;
        drop(a);
        drop(b);

        // b was returned last, so it sits at the head
        assert_eq!(*pool.acquire().await.unwrap(), b_id);
        assert_eq!(*pool.acquire().await.unwrap(), b_id);
        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.borrowed, 0);
    }

    #[tokio::test]
    async fn test_never_hands_out_same_resource_twice() {
        let (pool, _) = pool(manual());
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.acquire().await.unwrap());
        }
        held.truncate(4);
        for _ in 0..4 {
            held.push(pool.acquire().await.unwrap());
        }
        let ids: HashSet<u32> = held.iter().map(|r| **r).collect();
        assert_eq!(ids.len(), held.len());
        assert_eq!(pool.stats().borrowed, 8);
    }

    #[tokio::test]
    async fn test_invalid_release_is_destroyed() {
        let (pool, counter) = pool(manual());
        let resource = pool.acquire().await.unwrap();
        counter.bad.lock().unwrap().insert(*resource);
        let id = *resource;
        drop(resource);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(*counter.destroyed.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_release_broken_skips_validation() {
        let (pool, counter) = pool(manual());
        let resource = pool.acquire().await.unwrap();
        let id = *resource;
        resource.release_broken();
        let stats = pool.stats();
        assert_eq!((stats.idle, stats.destroyed, stats.borrowed), (0, 1, 0));
        assert_eq!(*counter.destroyed.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_acquire_skips_idle_resource_gone_invalid() {
        let (pool, counter) = pool(manual());
        let resource = pool.acquire().await.unwrap();
        let id = *resource;
        drop(resource);
        counter.bad.lock().unwrap().insert(id);

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(*fresh, id);
        assert_eq!(*counter.destroyed.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_create_failure_is_resource_creation_error() {
        let (pool, counter) = pool(manual());
        counter.fail_create.store(true, Ordering::SeqCst);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::ResourceCreation { .. }));
        assert!(err.is_connection_error());
        assert_eq!(pool.stats().borrowed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_stops_at_first_fresh_entry() {
        let (pool, counter) = pool(manual());
        let old = pool.acquire().await.unwrap();
        let young = pool.acquire().await.unwrap();
        let (old_id, young_id) = (*old, *young);

        drop(old);
        tokio::time::advance(Duration::from_millis(150)).await;
        drop(young);

        assert_eq!(pool.evict_idle().await, 1);
        assert_eq!(*counter.destroyed.lock().unwrap(), vec![old_id]);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(*pool.acquire().await.unwrap(), young_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_checks_health() {
        let (pool, counter) = pool(manual());
        let resource = pool.acquire().await.unwrap();
        let id = *resource;
        drop(resource);
        counter.unhealthy.lock().unwrap().insert(id);

        assert_eq!(pool.evict_idle().await, 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_evicts_stale_entries() {
        let (pool, counter) = pool(PoolConfig {
            sweep_interval: Some(Duration::from_millis(50)),
            ..manual()
        });
        let resource = pool.acquire().await.unwrap();
        let id = *resource;
        drop(resource);

        tokio::time::sleep(Duration::from_millis(260)).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(*counter.destroyed.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_stray_release_does_not_wrap_borrowed() {
        let (pool, counter) = pool(manual());
        pool.release(41).unwrap();
        pool.release_broken(42);

        let stats = pool.stats();
        assert_eq!((stats.borrowed, stats.idle, stats.destroyed), (0, 1, 1));
        assert_eq!(*counter.destroyed.lock().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects() {
        let (pool, counter) = pool(PoolConfig::default());
        let held = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        drop(idle);

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(counter.destroyed.lock().unwrap().len(), 1);
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));

        // returning to a closed pool destroys the resource
        assert!(matches!(held.release(), Err(Error::PoolClosed)));
        assert_eq!(counter.destroyed.lock().unwrap().len(), 2);
        assert_eq!(pool.stats().borrowed, 0);
    }
}
