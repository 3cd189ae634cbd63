//! Scriptable in-memory backend provider.

use super::xa::RecordingXaResource;
use crate::backend::{
    Connection, ConnectionFactory, Consumer, Destination, DestinationKind, ExceptionListener,
    Message, Producer, Session,
};
use crate::config::ActivationConfig;
use crate::context::DestinationResolver;
use crate::error::{AdapterError, Result};
use crate::xa::XaResource;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct BrokerState {
    /// Messages waiting to be received, per destination name
    pending: HashMap<String, VecDeque<Message>>,
    /// Messages sent through producers, per destination name
    sent: HashMap<String, Vec<Message>>,
    /// Selectors used when consumers were created, per destination name
    selectors: HashMap<String, Vec<Option<String>>>,
    /// Durable subscription names seen, per destination name
    subscriptions: HashMap<String, Vec<String>>,
    /// The most recently registered exception listener
    exception_listener: Option<Arc<dyn ExceptionListener>>,
    /// XA resources handed out by transacted sessions
    xa_resources: Vec<Arc<RecordingXaResource>>,
    /// Client ids assigned to connections
    client_ids: Vec<String>,
}

/// In-memory backend with per-destination message queues, failure
/// injection, and call recording
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    next_connection_id: AtomicU64,
    /// Remaining `create_session` calls that should fail
    fail_sessions: AtomicU32,
}

impl MockBroker {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            next_connection_id: AtomicU64::new(1),
            fail_sessions: AtomicU32::new(0),
        })
    }

    /// Open a connection to this broker
    pub async fn connect(self: &Arc<Self>) -> Arc<dyn Connection> {
        Arc::new(MockConnection {
            broker: Arc::clone(self),
            id: self.next_connection_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    /// Queue a message for consumption from a destination
    pub fn enqueue(&self, destination: &str, message: Message) {
        self.state
            .lock()
            .pending
            .entry(destination.to_string())
            .or_default()
            .push_back(message);
    }

    /// Messages sent through producers to a destination
    pub fn sent_messages(&self, destination: &str) -> Vec<Message> {
        self.state
            .lock()
            .sent
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages still pending consumption on a destination
    pub fn pending_count(&self, destination: &str) -> usize {
        self.state
            .lock()
            .pending
            .get(destination)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Selectors consumers were created with on a destination
    pub fn consumer_selectors(&self, destination: &str) -> Vec<Option<String>> {
        self.state
            .lock()
            .selectors
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Durable subscription names registered on a destination
    pub fn subscriptions(&self, destination: &str) -> Vec<String> {
        self.state
            .lock()
            .subscriptions
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Client ids assigned across connections
    pub fn client_ids(&self) -> Vec<String> {
        self.state.lock().client_ids.clone()
    }

    /// XA resources spawned by transacted sessions so far
    pub fn xa_resources(&self) -> Vec<Arc<RecordingXaResource>> {
        self.state.lock().xa_resources.clone()
    }

    /// Fail the next `count` `create_session` calls
    pub fn fail_next_sessions(&self, count: u32) {
        self.fail_sessions.store(count, Ordering::SeqCst);
    }

    /// Raise a connection exception on the registered listener
    pub fn raise_connection_exception(&self, error: AdapterError) {
        let listener = self.state.lock().exception_listener.clone();
        if let Some(listener) = listener {
            listener.on_connection_exception(error);
        }
    }

    fn take_session_failure(&self) -> bool {
        loop {
            let current = self.fail_sessions.load(Ordering::SeqCst);
            if current == 0 {
                return false;
            }
            let next = if current == u32::MAX { current } else { current - 1 };
            if self
                .fail_sessions
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }
}

struct MockConnection {
    broker: Arc<MockBroker>,
    id: u64,
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_session(&self, transacted: bool) -> Result<Box<dyn Session>> {
        if self.broker.take_session_failure() {
            return Err(AdapterError::connection("scripted session failure"));
        }
        let xa = if transacted {
            let resource = Arc::new(RecordingXaResource::new(self.id));
            self.broker.state.lock().xa_resources.push(resource.clone());
            Some(resource)
        } else {
            None
        };
        Ok(Box::new(MockSession {
            broker: Arc::clone(&self.broker),
            xa,
        }))
    }

    async fn set_client_id(&self, client_id: &str) -> Result<()> {
        self.broker
            .state
            .lock()
            .client_ids
            .push(client_id.to_string());
        Ok(())
    }

    fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>) {
        self.broker.state.lock().exception_listener = Some(listener);
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn physical_id(&self) -> u64 {
        self.id
    }
}

struct MockSession {
    broker: Arc<MockBroker>,
    xa: Option<Arc<RecordingXaResource>>,
}

#[async_trait]
impl Session for MockSession {
    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Box<dyn Consumer>> {
        self.broker
            .state
            .lock()
            .selectors
            .entry(destination.name.clone())
            .or_default()
            .push(selector.map(str::to_string));
        Ok(Box::new(MockConsumer {
            broker: Arc::clone(&self.broker),
            destination: destination.name.clone(),
        }))
    }

    async fn create_durable_consumer(
        &self,
        destination: &Destination,
        subscription_name: &str,
        selector: Option<&str>,
    ) -> Result<Box<dyn Consumer>> {
        self.broker
            .state
            .lock()
            .subscriptions
            .entry(destination.name.clone())
            .or_default()
            .push(subscription_name.to_string());
        self.create_consumer(destination, selector).await
    }

    async fn create_producer(&self, destination: &Destination) -> Result<Box<dyn Producer>> {
        Ok(Box::new(MockProducer {
            broker: Arc::clone(&self.broker),
            destination: destination.name.clone(),
        }))
    }

    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        self.xa
            .as_ref()
            .map(|r| Arc::clone(r) as Arc<dyn XaResource>)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MockConsumer {
    broker: Arc<MockBroker>,
    destination: String,
}

#[async_trait]
impl Consumer for MockConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        let message = self
            .broker
            .state
            .lock()
            .pending
            .get_mut(&self.destination)
            .and_then(VecDeque::pop_front);
        if message.is_some() {
            return Ok(message);
        }
        // Empty queue: model the blocking receive without spinning
        tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
        Ok(None)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MockProducer {
    broker: Arc<MockBroker>,
    destination: String,
}

#[async_trait]
impl Producer for MockProducer {
    async fn send(&self, message: &Message) -> Result<()> {
        self.broker
            .state
            .lock()
            .sent
            .entry(self.destination.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connection factory over a [`MockBroker`], with scriptable connect failures
pub struct MockConnectionFactory {
    broker: Arc<MockBroker>,
    fail_connects: AtomicU32,
}

impl MockConnectionFactory {
    pub fn new(broker: Arc<MockBroker>) -> Self {
        Self {
            broker,
            fail_connects: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` `create_connection` calls (`u32::MAX` = always)
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create_connection(&self) -> Result<Arc<dyn Connection>> {
        loop {
            let current = self.fail_connects.load(Ordering::SeqCst);
            if current == 0 {
                break;
            }
            let next = if current == u32::MAX { current } else { current - 1 };
            if self
                .fail_connects
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(AdapterError::connection("scripted connect failure"));
            }
        }
        Ok(self.broker.connect().await)
    }
}

/// Resolver handing out a fixed connection factory and pass-through
/// destinations
pub struct MockResolver {
    factory: Arc<MockConnectionFactory>,
}

impl MockResolver {
    pub fn new(factory: Arc<MockConnectionFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl DestinationResolver for MockResolver {
    async fn resolve_connection_factory(
        &self,
        _config: &ActivationConfig,
    ) -> Result<Arc<dyn ConnectionFactory>> {
        Ok(Arc::clone(&self.factory) as Arc<dyn ConnectionFactory>)
    }

    async fn resolve_destination(
        &self,
        name: &str,
        kind: DestinationKind,
    ) -> Result<Destination> {
        Ok(Destination {
            name: name.to_string(),
            kind,
        })
    }
}
