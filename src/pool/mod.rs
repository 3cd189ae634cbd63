//! # Delivery Resource Pool
//!
//! Bounded pool of reusable delivery resources, each pairing one backend
//! session with an endpoint placeholder. Supports blocking acquisition with
//! a total-wait budget, a FIFO-fair waiter queue, wake-exactly-one release
//! semantics, a pre-flight endpoint readiness probe, and graceful
//! stop/destroy that forcibly releases waiters before awaiting in-flight
//! resources.
//!
//! Invariant: `busy + free == current <= max_size` holds under the pool
//! lock at all times; `acquire` never creates beyond `max_size` (in-flight
//! creations count against capacity).

pub mod resource;

pub use resource::DeliveryResource;

use crate::config::ActivationConfig;
use crate::endpoint::EndpointFactory;
use crate::error::{AdapterError, Result};
use crate::monitoring::PoolSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Creates delivery resources on behalf of the pool (lazily, up to capacity)
#[async_trait]
pub trait ResourceFactory: Send + Sync {
    async fn create_resource(&self, id: u64) -> Result<DeliveryResource>;
}

/// Pool sizing and timing limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub max_wait: Duration,
    pub release_timeout: Duration,
}

impl PoolConfig {
    pub fn from_activation(config: &ActivationConfig) -> Self {
        Self {
            max_size: config.pool_max_size,
            max_wait: config.max_wait(),
            release_timeout: config.release_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolPhase {
    Running,
    Stopping,
    Destroyed,
}

/// A queued acquirer: arrival-ordered, woken individually by one release
struct Waiter {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<DeliveryResource>,
}

struct PoolState {
    phase: PoolPhase,
    free: Vec<DeliveryResource>,
    busy: usize,
    /// Creations reserved but not yet completed; count against capacity
    pending_creates: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    next_resource_id: u64,
}

impl PoolState {
    fn current(&self) -> usize {
        self.busy + self.free.len() + self.pending_creates
    }
}

/// What `acquire` decided to do under the lock
enum AcquireStep {
    Acquired(DeliveryResource),
    Create(u64),
    Wait(u64, oneshot::Receiver<DeliveryResource>),
}

/// Bounded pool of delivery resources with FIFO-fair blocking acquisition
pub struct ResourcePool {
    config: PoolConfig,
    factory: Arc<dyn ResourceFactory>,
    state: Mutex<PoolState>,
    /// Signaled when the last busy resource returns during stop
    drained: Notify,
}

impl ResourcePool {
    pub fn new(config: PoolConfig, factory: Arc<dyn ResourceFactory>) -> Arc<Self> {
        info!(
            max_size = config.max_size,
            max_wait_ms = config.max_wait.as_millis() as u64,
            "Resource pool created"
        );
        Arc::new(Self {
            config,
            factory,
            state: Mutex::new(PoolState {
                phase: PoolPhase::Running,
                free: Vec::new(),
                busy: 0,
                pending_creates: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                next_resource_id: 0,
            }),
            drained: Notify::new(),
        })
    }

    /// Acquire a free resource, waiting up to `timeout` in total.
    ///
    /// The remaining budget is recomputed on every loop iteration from the
    /// original arrival instant, so spurious wakeups cannot extend the total
    /// wait. Zero remaining budget yields a pool-exhausted error; a stopped
    /// pool yields a pool-destroyed error immediately.
    pub async fn acquire(&self, timeout: Duration) -> Result<DeliveryResource> {
        let started = Instant::now();

        loop {
            let step = {
                let mut state = self.state.lock();
                match state.phase {
                    PoolPhase::Stopping | PoolPhase::Destroyed => {
                        return Err(AdapterError::PoolDestroyed)
                    }
                    PoolPhase::Running => {
                        if let Some(resource) = state.free.pop() {
                            state.busy += 1;
                            AcquireStep::Acquired(resource)
                        } else if state.current() < self.config.max_size {
                            state.pending_creates += 1;
                            let id = state.next_resource_id;
                            state.next_resource_id += 1;
                            AcquireStep::Create(id)
                        } else {
                            let (tx, rx) = oneshot::channel();
                            let id = state.next_waiter_id;
                            state.next_waiter_id += 1;
                            state.waiters.push_back(Waiter {
                                id,
                                enqueued_at: started,
                                tx,
                            });
                            AcquireStep::Wait(id, rx)
                        }
                    }
                }
            };

            match step {
                AcquireStep::Acquired(resource) => {
                    debug!(resource_id = resource.id(), "Acquired free resource");
                    return Ok(resource);
                }
                AcquireStep::Create(id) => return self.create_and_hand_out(id).await,
                AcquireStep::Wait(waiter_id, rx) => {
                    match self.wait_for_handoff(waiter_id, rx, started, timeout).await {
                        Some(result) => return result,
                        // Sender dropped without a resource (pool stopping);
                        // loop to observe the phase
                        None => continue,
                    }
                }
            }
        }
    }

    async fn create_and_hand_out(&self, id: u64) -> Result<DeliveryResource> {
        debug!(resource_id = id, "Creating delivery resource");
        let created = self.factory.create_resource(id).await;

        // Decide under the lock; the stopping-phase teardown awaits, so it
        // happens strictly after the lock scope closes
        let discarded = {
            let mut state = self.state.lock();
            state.pending_creates -= 1;
            match created {
                Ok(resource) => {
                    if state.phase == PoolPhase::Running {
                        state.busy += 1;
                        debug!(resource_id = id, current = state.current(), "Resource created");
                        return Ok(resource);
                    }
                    resource
                }
                Err(e) => {
                    // The reserved capacity is free again; wake the FIFO-head
                    // waiter so it can retry the create instead of sitting
                    // out its timeout (dropping the sender re-enters its
                    // acquire loop)
                    state.waiters.pop_front();
                    warn!(resource_id = id, error = %e, "Failed to create delivery resource");
                    return Err(e);
                }
            }
        };

        discarded.destroy().await;
        Err(AdapterError::PoolDestroyed)
    }

    /// Wait on the one-shot handoff channel with the remaining budget.
    /// `Some(result)` resolves the acquire; `None` means retry the loop.
    async fn wait_for_handoff(
        &self,
        waiter_id: u64,
        mut rx: oneshot::Receiver<DeliveryResource>,
        started: Instant,
        timeout: Duration,
    ) -> Option<Result<DeliveryResource>> {
        let elapsed = started.elapsed();
        let remaining = match timeout.checked_sub(elapsed) {
            Some(r) if !r.is_zero() => r,
            _ => {
                self.remove_waiter(waiter_id);
                return Some(self.timed_out(waiter_id, rx, timeout).await);
            }
        };

        match tokio::time::timeout(remaining, &mut rx).await {
            Ok(Ok(resource)) => {
                debug!(
                    resource_id = resource.id(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Waiter received handed-off resource"
                );
                Some(Ok(resource))
            }
            Ok(Err(_)) => None,
            Err(_) => {
                self.remove_waiter(waiter_id);
                Some(self.timed_out(waiter_id, rx, timeout).await)
            }
        }
    }

    /// Resolve a timed-out waiter, handling the race where a release handed
    /// a resource over just before the waiter entry was removed.
    async fn timed_out(
        &self,
        waiter_id: u64,
        mut rx: oneshot::Receiver<DeliveryResource>,
        timeout: Duration,
    ) -> Result<DeliveryResource> {
        if let Ok(resource) = rx.try_recv() {
            // Lost the race: the resource was already sent. Put it back so
            // the next waiter gets it.
            debug!(
                waiter_id,
                resource_id = resource.id(),
                "Timed-out waiter returning raced handoff to the pool"
            );
            self.release(resource).await;
        }
        warn!(
            waiter_id,
            waited_ms = timeout.as_millis() as u64,
            "Acquisition timed out waiting for a free resource"
        );
        Err(AdapterError::PoolExhausted {
            waited_ms: timeout.as_millis() as u64,
        })
    }

    fn remove_waiter(&self, waiter_id: u64) {
        let mut state = self.state.lock();
        state.waiters.retain(|w| w.id != waiter_id);
    }

    /// Return a resource to the pool.
    ///
    /// Wakes exactly one FIFO-head waiter when waiters exist; broadcast is
    /// deliberately avoided to prevent thundering-herd reacquire storms.
    pub async fn release(&self, resource: DeliveryResource) {
        let mut resource = resource;
        let destroy = {
            let mut state = self.state.lock();
            match state.phase {
                PoolPhase::Destroyed => {
                    state.busy = state.busy.saturating_sub(1);
                    true
                }
                PoolPhase::Stopping => {
                    state.busy -= 1;
                    state.free.push(resource);
                    if state.busy == 0 {
                        self.drained.notify_waiters();
                    }
                    return;
                }
                PoolPhase::Running => {
                    // Hand off directly to the oldest waiter; the resource
                    // stays busy, ownership just moves.
                    while let Some(waiter) = state.waiters.pop_front() {
                        let waited = waiter.enqueued_at.elapsed();
                        match waiter.tx.send(resource) {
                            Ok(()) => {
                                debug!(
                                    waiter_id = waiter.id,
                                    waited_ms = waited.as_millis() as u64,
                                    "Released resource handed to FIFO-head waiter"
                                );
                                return;
                            }
                            // Waiter timed out and dropped its receiver;
                            // try the next one
                            Err(returned) => resource = returned,
                        }
                    }
                    state.busy -= 1;
                    state.free.push(resource);
                    return;
                }
            }
        };

        if destroy {
            resource.destroy().await;
        }
    }

    /// Pre-flight readiness probe: verify the container endpoint can be
    /// created before the pool serves its first acquisition, retrying up to
    /// `attempts` times with `interval` between tries.
    ///
    /// Detects "endpoint not yet deployed" and fails fast instead of
    /// silently wedging every delivery.
    pub async fn probe_endpoint(
        &self,
        endpoint_factory: &Arc<dyn EndpointFactory>,
        attempts: u32,
        interval: Duration,
    ) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=attempts.max(1) {
            match endpoint_factory.create_endpoint(None).await {
                Ok(mut endpoint) => {
                    endpoint.release().await;
                    debug!(attempt, "Endpoint readiness probe succeeded");
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Endpoint readiness probe attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Err(AdapterError::configuration(format!(
            "endpoint not ready after {attempts} probe attempts: {detail}"
        )))
    }

    /// Stop the pool: fail all queued waiters immediately, wait (bounded by
    /// the release timeout) for in-use resources to return, then destroy
    /// every resource. Never returns an error.
    pub async fn stop(&self) {
        let waiters = {
            let mut state = self.state.lock();
            if state.phase != PoolPhase::Running {
                return;
            }
            state.phase = PoolPhase::Stopping;
            std::mem::take(&mut state.waiters)
        };

        info!(released_waiters = waiters.len(), "Stopping resource pool");
        // Dropping the senders fails every queued waiter immediately
        drop(waiters);

        let deadline = Instant::now() + self.config.release_timeout;
        loop {
            let busy = self.state.lock().busy;
            if busy == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    still_busy = busy,
                    release_timeout_ms = self.config.release_timeout.as_millis() as u64,
                    "Release timeout expired with resources still in use"
                );
                break;
            }
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register interest before re-checking, so a release between the
            // check and the await cannot be missed
            notified.as_mut().enable();
            if self.state.lock().busy == 0 {
                break;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }

        let free = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.free)
        };
        for resource in free {
            resource.destroy().await;
        }
        info!("Resource pool stopped");
    }

    /// Stop and permanently destroy the pool. Idempotent, never throws.
    pub async fn destroy(&self) {
        self.stop().await;
        let leftover = {
            let mut state = self.state.lock();
            state.phase = PoolPhase::Destroyed;
            std::mem::take(&mut state.free)
        };
        for resource in leftover {
            resource.destroy().await;
        }
        debug!("Resource pool destroyed");
    }

    /// Monitoring snapshot of the pool counters
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        PoolSnapshot {
            current_resources: state.busy + state.free.len(),
            busy_resources: state.busy,
            free_resources: state.free.len(),
            waiting_count: state.waiters.len(),
            max_size: self.config.max_size,
            max_wait_ms: self.config.max_wait.as_millis() as u64,
        }
    }

    /// Configured maximum wait for acquisitions
    pub fn max_wait(&self) -> Duration {
        self.config.max_wait
    }

    /// Configured capacity
    pub fn max_size(&self) -> usize {
        self.config.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CountingResourceFactory, MockEndpointFactory};
    use std::collections::HashSet;
    use tokio_test::{assert_err, assert_ok};

    fn pool_config(max_size: usize, max_wait_ms: u64) -> PoolConfig {
        PoolConfig {
            max_size,
            max_wait: Duration::from_millis(max_wait_ms),
            release_timeout: Duration::from_millis(1_000),
        }
    }

    fn test_pool(max_size: usize, max_wait_ms: u64) -> Arc<ResourcePool> {
        ResourcePool::new(
            pool_config(max_size, max_wait_ms),
            Arc::new(CountingResourceFactory::new()),
        )
    }

    #[tokio::test]
    async fn test_concurrent_acquires_get_distinct_resources() {
        let pool = test_pool(4, 500);

        let mut resources = Vec::new();
        for _ in 0..4 {
            resources.push(pool.acquire(Duration::from_millis(500)).await.unwrap());
        }

        let ids: HashSet<u64> = resources.iter().map(|r| r.id()).collect();
        assert_eq!(ids.len(), 4);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.busy_resources, 4);
        assert_eq!(snapshot.current_resources, 4);
        assert!(snapshot.is_saturated());

        for resource in resources {
            pool.release(resource).await;
        }
        assert_eq!(pool.snapshot().free_resources, 4);
    }

    #[tokio::test]
    async fn test_extra_acquire_blocks_until_release() {
        let pool = test_pool(1, 2_000);
        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();

        let pool_clone = Arc::clone(&pool);
        let blocked = tokio::spawn(async move {
            pool_clone.acquire(Duration::from_millis(2_000)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.snapshot().waiting_count, 1);

        pool.release(held).await;
        let resource = blocked.await.unwrap().unwrap();
        assert_eq!(pool.snapshot().waiting_count, 0);
        pool.release(resource).await;
    }

    #[tokio::test]
    async fn test_acquire_times_out_within_budget() {
        let pool = test_pool(1, 500);
        let _held = pool.acquire(Duration::from_millis(100)).await.unwrap();

        let started = std::time::Instant::now();
        let result = pool.acquire(Duration::from_millis(500)).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(AdapterError::PoolExhausted { .. })));
        assert!(elapsed >= Duration::from_millis(450), "returned too early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(700), "returned too late: {elapsed:?}");
        // Waiter entry was removed
        assert_eq!(pool.snapshot().waiting_count, 0);
    }

    #[tokio::test]
    async fn test_release_wakes_exactly_one_waiter() {
        let pool = test_pool(1, 5_000);
        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let pool_clone = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool_clone.acquire(Duration::from_millis(5_000)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.snapshot().waiting_count, 3);

        pool.release(held).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Exactly one waiter got the resource, the other two still queue
        assert_eq!(pool.snapshot().waiting_count, 2);
        assert_eq!(pool.snapshot().busy_resources, 1);

        pool.destroy().await;
        for handle in handles {
            let _ = handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fifo_fairness() {
        let pool = test_pool(1, 5_000);
        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();

        let pool_a = Arc::clone(&pool);
        let first = tokio::spawn(async move { pool_a.acquire(Duration::from_millis(5_000)).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let pool_b = Arc::clone(&pool);
        let second = tokio::spawn(async move { pool_b.acquire(Duration::from_millis(5_000)).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        pool.release(held).await;

        // The oldest waiter is served first
        let got = tokio::time::timeout(Duration::from_millis(500), first)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!second.is_finished());

        pool.release(got).await;
        let got = second.await.unwrap().unwrap();
        pool.release(got).await;
    }

    #[tokio::test]
    async fn test_stop_fails_waiters_and_drains() {
        let pool = test_pool(1, 5_000);
        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();

        let pool_clone = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            pool_clone.acquire(Duration::from_millis(5_000)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let pool_stop = Arc::clone(&pool);
        let stopper = tokio::spawn(async move { pool_stop.stop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Waiter fails promptly with a pool-destroyed error
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AdapterError::PoolDestroyed)));

        // Stop completes once the in-use resource returns
        assert!(!stopper.is_finished());
        pool.release(held).await;
        tokio::time::timeout(Duration::from_millis(1_000), stopper)
            .await
            .expect("stop should finish after drain")
            .unwrap();

        // Post-stop acquisitions fail immediately
        assert!(matches!(
            pool.acquire(Duration::from_millis(100)).await,
            Err(AdapterError::PoolDestroyed)
        ));
    }

    #[tokio::test]
    async fn test_never_creates_beyond_max_size() {
        let factory = Arc::new(CountingResourceFactory::new());
        let pool = ResourcePool::new(pool_config(2, 100), factory.clone());

        let a = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_err!(pool.acquire(Duration::from_millis(100)).await);

        pool.release(a).await;
        let c = pool.acquire(Duration::from_millis(100)).await.unwrap();

        assert_eq!(factory.created(), 2);
        pool.release(b).await;
        pool.release(c).await;
    }

    #[tokio::test]
    async fn test_failed_creation_wakes_queued_waiter() {
        let factory = Arc::new(CountingResourceFactory::new());
        factory.set_create_delay(Duration::from_millis(100));
        factory.fail_next_creates(1);
        let pool = ResourcePool::new(pool_config(1, 2_000), factory.clone());

        // First acquirer reserves the single slot and its creation fails
        let pool_clone = Arc::clone(&pool);
        let first = tokio::spawn(async move {
            pool_clone.acquire(Duration::from_millis(2_000)).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Second acquirer queues behind the in-flight creation; the failure
        // must wake it so it retries the create instead of burning its
        // whole budget
        let started = std::time::Instant::now();
        let second = pool.acquire(Duration::from_millis(2_000)).await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(1_000), "woke too late: {elapsed:?}");
        assert_err!(first.await.unwrap());
        assert_eq!(factory.created(), 1);
        pool.release(second).await;
    }

    #[tokio::test]
    async fn test_probe_endpoint_retries_then_succeeds() {
        let pool = test_pool(1, 100);
        let endpoint_factory = MockEndpointFactory::new(false);
        endpoint_factory.fail_next_creates(2);
        let factory: Arc<dyn EndpointFactory> = Arc::new(endpoint_factory);

        assert_ok!(
            pool.probe_endpoint(&factory, 3, Duration::from_millis(10))
                .await
        );
    }

    #[tokio::test]
    async fn test_probe_endpoint_fails_fast_when_never_ready() {
        let pool = test_pool(1, 100);
        let endpoint_factory = MockEndpointFactory::new(false);
        endpoint_factory.fail_next_creates(u32::MAX);
        let factory: Arc<dyn EndpointFactory> = Arc::new(endpoint_factory);

        let result = pool
            .probe_endpoint(&factory, 3, Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(AdapterError::Configuration { .. })));
    }
}
