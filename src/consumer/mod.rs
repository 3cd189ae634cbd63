//! # Consumer Controller
//!
//! Owns the lifecycle of one inbound endpoint activation: resolve the
//! backend objects, open and start the physical connection, build the
//! delivery resource pool, run the readiness probe, and spawn the receiver
//! tasks that pump messages through the delivery coordinator.
//!
//! Two registration styles exist. Pull mode runs one dedicated receiver
//! task per pool slot, each cycling acquire → receive → deliver → release.
//! Push mode runs a single dispatcher task that drains up to `batch_size`
//! messages per acquired resource before handing it back, modelling
//! provider-driven batch dispatch over the same pool.

use crate::backend::{Connection, Destination, DestinationKind};
use crate::config::{ActivationConfig, ConsumerMode};
use crate::context::AdapterContext;
use crate::delivery::{DeadLetterSender, DeliveryCoordinator};
use crate::error::{AdapterError, Result};
use crate::monitoring::PoolSnapshot;
use crate::pool::{DeliveryResource, PoolConfig, ResourceFactory, ResourcePool};
use crate::reconnect::ReconnectSupervisor;
use crate::xa::{
    BranchStrategy, DelayedStartBranch, FirstPhysicalBranch, RmSharingPolicy, SimpleBranch,
    TransactionBranch, XaResource,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long one receive poll blocks before the resource goes back to the pool
const RECEIVE_POLL: Duration = Duration::from_millis(500);

/// Bound on waiting for a receiver task to exit after pool destruction
const WORKER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the branch proxy for one transacted session
pub fn build_branch(
    resource: Arc<dyn XaResource>,
    strategy: BranchStrategy,
    policy: RmSharingPolicy,
) -> Arc<dyn TransactionBranch> {
    match strategy {
        BranchStrategy::Simple => Arc::new(SimpleBranch::new(resource, policy)),
        BranchStrategy::DelayedStart => Arc::new(DelayedStartBranch::new(resource, policy)),
        BranchStrategy::FirstPhysical => Arc::new(FirstPhysicalBranch::new(resource, policy)),
    }
}

/// Synthesize the effective message selector for this instance.
///
/// Load-balanced deployments partition messages across instances by
/// timestamp residue, combined with the configured base filter when one
/// exists.
pub fn delivery_selector(config: &ActivationConfig) -> Option<String> {
    if !config.load_balanced() {
        return config.message_selector.clone();
    }
    let count = config.instance_count;
    let index = config.instance_index;
    let partition =
        format!("(timestamp - (timestamp / {count}) * {count}) = {index}");
    match &config.message_selector {
        Some(base) => Some(format!("({base}) AND ({partition})")),
        None => Some(partition),
    }
}

/// The client identifier to assign to the connection, if any.
///
/// With derivation enabled, each instance gets a unique identifier suffixed
/// onto the configured base (or the destination name), so multiple
/// instances can share one durable activation config without colliding.
pub fn effective_client_id(config: &ActivationConfig) -> Option<String> {
    if config.derive_client_id {
        let base = config
            .client_id
            .clone()
            .unwrap_or_else(|| config.destination.clone());
        Some(format!("{base}-{}", Uuid::new_v4()))
    } else {
        config.client_id.clone()
    }
}

/// Creates delivery resources for the pool: one session per resource, with
/// its branch proxy (when transacted) and its consumer already bound
pub struct SessionResourceFactory {
    connection: Arc<dyn Connection>,
    config: Arc<ActivationConfig>,
    destination: Destination,
    selector: Option<String>,
    transacted: bool,
}

impl SessionResourceFactory {
    pub fn new(
        connection: Arc<dyn Connection>,
        config: Arc<ActivationConfig>,
        destination: Destination,
        selector: Option<String>,
        transacted: bool,
    ) -> Self {
        Self {
            connection,
            config,
            destination,
            selector,
            transacted,
        }
    }
}

#[async_trait]
impl ResourceFactory for SessionResourceFactory {
    async fn create_resource(&self, id: u64) -> Result<DeliveryResource> {
        let session = self.connection.create_session(self.transacted).await?;

        let branch = if self.transacted {
            let xa = session.xa_resource().ok_or_else(|| {
                AdapterError::backend(
                    "create_session",
                    "transacted session exposed no XA resource",
                )
            })?;
            Some(build_branch(
                xa,
                self.config.branch_strategy,
                self.config.rm_sharing_policy,
            ))
        } else {
            None
        };

        let consumer = if self.config.durable {
            let subscription = self.config.subscription_name.as_deref().ok_or_else(|| {
                AdapterError::configuration("subscription name required for a durable consumer")
            })?;
            session
                .create_durable_consumer(&self.destination, subscription, self.selector.as_deref())
                .await?
        } else {
            session
                .create_consumer(&self.destination, self.selector.as_deref())
                .await?
        };

        let mut resource = DeliveryResource::new(id, session, branch);
        resource.set_consumer(consumer);
        Ok(resource)
    }
}

struct ActiveConsumer {
    connection: Arc<dyn Connection>,
    pool: Arc<ResourcePool>,
    workers: Vec<JoinHandle<()>>,
}

/// Lifecycle controller for one endpoint activation
pub struct ConsumerController {
    config: Arc<ActivationConfig>,
    context: AdapterContext,
    active: tokio::sync::Mutex<Option<ActiveConsumer>>,
}

impl ConsumerController {
    pub fn new(config: ActivationConfig, context: AdapterContext) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            context,
            active: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ActivationConfig {
        &self.config
    }

    /// Start delivery: open the connection, build the pool, probe the
    /// endpoint, and spawn the receiver tasks. Idempotent while running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            debug!(destination = %self.config.destination, "Consumer controller already started");
            return Ok(());
        }

        self.config.validate()?;
        info!(
            destination = %self.config.destination,
            mode = ?self.config.consumer_mode,
            pool_max_size = self.config.pool_max_size,
            "🚀 Starting consumer controller"
        );

        let connection_factory = self
            .context
            .resolver()
            .resolve_connection_factory(&self.config)
            .await?;
        let connection = connection_factory.create_connection().await?;

        if let Some(client_id) = effective_client_id(&self.config) {
            connection.set_client_id(&client_id).await?;
        }

        let supervisor = Arc::new(ReconnectSupervisor::new(
            Arc::downgrade(self),
            Arc::clone(&self.config),
        ));
        connection.set_exception_listener(supervisor);

        let destination = self
            .context
            .resolver()
            .resolve_destination(&self.config.destination, self.config.destination_kind)
            .await?;
        let selector = delivery_selector(&self.config);
        let transacted = self.context.endpoint_factory().is_delivery_transacted();

        let resource_factory = Arc::new(SessionResourceFactory::new(
            Arc::clone(&connection),
            Arc::clone(&self.config),
            destination,
            selector,
            transacted,
        ));
        let pool = ResourcePool::new(PoolConfig::from_activation(&self.config), resource_factory);

        // Fail fast on an undeployed endpoint before any message is consumed
        if let Err(e) = pool
            .probe_endpoint(
                self.context.endpoint_factory(),
                self.config.endpoint_probe_attempts,
                self.config.endpoint_probe_interval(),
            )
            .await
        {
            pool.destroy().await;
            if let Err(close_err) = connection.close().await {
                warn!(error = %close_err, "Failed to close connection after probe failure");
            }
            return Err(e);
        }

        let dead_letter = if self.config.dead_letter_enabled {
            match &self.config.dead_letter_destination {
                Some(name) => {
                    let dlq = self
                        .context
                        .resolver()
                        .resolve_destination(name, DestinationKind::PointToPoint)
                        .await?;
                    Some(Arc::new(DeadLetterSender::new(Arc::clone(&connection), dlq)))
                }
                // validate() already rejected this combination
                None => None,
            }
        } else {
            None
        };

        let coordinator = Arc::new(DeliveryCoordinator::new(
            Arc::clone(&self.config),
            Arc::clone(self.context.endpoint_factory()),
            dead_letter,
        ));

        connection.start().await?;

        let workers = match self.config.consumer_mode {
            ConsumerMode::Pull => spawn_pull_receivers(&pool, &coordinator),
            ConsumerMode::Push => spawn_push_dispatcher(&pool, &coordinator, self.config.batch_size),
        };

        info!(
            destination = %self.config.destination,
            workers = workers.len(),
            "✅ Consumer controller started"
        );
        *active = Some(ActiveConsumer {
            connection,
            pool,
            workers,
        });
        Ok(())
    }

    /// Stop delivery: destroy the pool, wait for receiver tasks, close the
    /// connection. Idempotent, never returns an error.
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().await.take() else {
            debug!(destination = %self.config.destination, "Consumer controller already stopped");
            return;
        };

        info!(destination = %self.config.destination, "Stopping consumer controller");
        active.pool.destroy().await;

        let aborts: Vec<_> = active.workers.iter().map(|w| w.abort_handle()).collect();
        if tokio::time::timeout(WORKER_EXIT_TIMEOUT, futures::future::join_all(active.workers))
            .await
            .is_err()
        {
            warn!("Receiver tasks did not exit in time, aborting them");
            for abort in aborts {
                abort.abort();
            }
        }

        if let Err(e) = active.connection.close().await {
            warn!(error = %e, "Failed to close backend connection");
        }
        info!(destination = %self.config.destination, "Consumer controller stopped");
    }

    /// Stop and start again over a fresh connection
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    /// Whether the controller currently has an active consumer
    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Monitoring snapshot of the active pool, if running
    pub async fn pool_snapshot(&self) -> Option<PoolSnapshot> {
        self.active.lock().await.as_ref().map(|a| a.pool.snapshot())
    }
}

fn spawn_pull_receivers(
    pool: &Arc<ResourcePool>,
    coordinator: &Arc<DeliveryCoordinator>,
) -> Vec<JoinHandle<()>> {
    (0..pool.max_size())
        .map(|worker| {
            let pool = Arc::clone(pool);
            let coordinator = Arc::clone(coordinator);
            tokio::spawn(async move { pull_receive_loop(worker, pool, coordinator).await })
        })
        .collect()
}

fn spawn_push_dispatcher(
    pool: &Arc<ResourcePool>,
    coordinator: &Arc<DeliveryCoordinator>,
    batch_size: u32,
) -> Vec<JoinHandle<()>> {
    let pool = Arc::clone(pool);
    let coordinator = Arc::clone(coordinator);
    vec![tokio::spawn(async move {
        push_dispatch_loop(pool, coordinator, batch_size).await
    })]
}

/// One pull-mode receiver: acquire a resource, poll its consumer, deliver,
/// release. Exits when the pool is destroyed.
async fn pull_receive_loop(
    worker: usize,
    pool: Arc<ResourcePool>,
    coordinator: Arc<DeliveryCoordinator>,
) {
    debug!(worker, "Receiver task started");
    loop {
        let mut resource = match pool.acquire(pool.max_wait()).await {
            Ok(resource) => resource,
            Err(AdapterError::PoolDestroyed) => break,
            Err(e) => {
                debug!(worker, error = %e, "Receiver could not acquire a resource");
                continue;
            }
        };

        let received = match resource.consumer() {
            Some(consumer) => consumer.receive(RECEIVE_POLL).await,
            None => {
                warn!(worker, "Pooled resource has no consumer bound");
                pool.release(resource).await;
                break;
            }
        };

        match received {
            Ok(Some(message)) => {
                if let Err(e) = coordinator.deliver(&mut resource, message).await {
                    warn!(worker, error = %e, "Delivery failed");
                }
                pool.release(resource).await;
            }
            Ok(None) => pool.release(resource).await,
            Err(e) => {
                warn!(worker, error = %e, "Receive failed");
                pool.release(resource).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!(worker, "Receiver task exited");
}

/// Push-mode dispatcher: drain up to `batch_size` messages per acquired
/// resource before returning it, so one dispatch serves a whole batch.
async fn push_dispatch_loop(
    pool: Arc<ResourcePool>,
    coordinator: Arc<DeliveryCoordinator>,
    batch_size: u32,
) {
    debug!(batch_size, "Dispatcher task started");
    loop {
        let mut resource = match pool.acquire(pool.max_wait()).await {
            Ok(resource) => resource,
            Err(AdapterError::PoolDestroyed) => break,
            Err(e) => {
                debug!(error = %e, "Dispatcher could not acquire a resource");
                continue;
            }
        };

        let mut dispatched = 0u32;
        while dispatched < batch_size {
            let received = match resource.consumer() {
                Some(consumer) => consumer.receive(RECEIVE_POLL).await,
                None => break,
            };
            match received {
                Ok(Some(message)) => {
                    if let Err(e) = coordinator.deliver(&mut resource, message).await {
                        warn!(error = %e, "Delivery failed");
                    }
                    dispatched += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Receive failed");
                    break;
                }
            }
        }
        pool.release(resource).await;
    }
    debug!("Dispatcher task exited");
}
