//! # Backend Provider Abstraction
//!
//! Trait seam over the external message-queue provider. The adapter never
//! implements a broker; it consumes connections, sessions, consumers and
//! producers through these traits and spawns one session per pooled
//! delivery resource.
//!
//! The physical connection is shared read-only across all resources of one
//! pool (it is only used to spawn sessions); each session is exclusively
//! owned by its delivery resource once acquired.

use crate::error::{AdapterError, Result};
use crate::xa::XaResource;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Destination kind for point-to-point or publish/subscribe delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    PointToPoint,
    PublishSubscribe,
}

/// A named backend destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::PointToPoint,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::PublishSubscribe,
        }
    }
}

/// A message received from or sent to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Provider-assigned message identifier
    pub id: String,

    /// Destination the message was received from (or is addressed to)
    pub destination: Destination,

    /// Message body
    pub body: serde_json::Value,

    /// String properties carried alongside the body
    pub properties: HashMap<String, String>,

    /// Redelivered flag, set by the delivery engine on retry attempts
    pub redelivered: bool,

    /// Provider timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Message {
    /// Create a message addressed to a destination
    pub fn new(id: impl Into<String>, destination: Destination, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            destination,
            body,
            properties: HashMap::new(),
            redelivered: false,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Set a string property, returning self for chaining
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Listener for backend connection failures
///
/// Implemented by the reconnect supervisor. The callback must never panic
/// or propagate errors back into the provider.
pub trait ExceptionListener: Send + Sync {
    fn on_connection_exception(&self, error: AdapterError);
}

/// Factory for physical backend connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self) -> Result<Arc<dyn Connection>>;
}

/// A physical backend connection
///
/// Shared across all delivery resources of one pool; only used to spawn
/// sessions and register the exception listener.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Create a new session; `transacted` requests an XA-capable session
    async fn create_session(&self, transacted: bool) -> Result<Box<dyn Session>>;

    /// Assign the client identifier (must happen before delivery starts)
    async fn set_client_id(&self, client_id: &str) -> Result<()>;

    /// Register the connection-exception listener
    fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>);

    /// Start message flow
    async fn start(&self) -> Result<()>;

    /// Close the connection and all sessions spawned from it
    async fn close(&self) -> Result<()>;

    /// Stable identity of the physical connection, used by the
    /// one-resource-manager-per-physical-connection sharing policy
    fn physical_id(&self) -> u64;
}

/// A backend session owned by one delivery resource
#[async_trait]
pub trait Session: Send + Sync {
    /// Create a non-durable consumer on a destination
    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Box<dyn Consumer>>;

    /// Create a durable consumer on a publish/subscribe destination
    async fn create_durable_consumer(
        &self,
        destination: &Destination,
        subscription_name: &str,
        selector: Option<&str>,
    ) -> Result<Box<dyn Consumer>>;

    /// Create a producer for a destination (used by the dead-letter sender)
    async fn create_producer(&self, destination: &Destination) -> Result<Box<dyn Producer>>;

    /// The session's physical two-phase-commit resource, when transacted
    fn xa_resource(&self) -> Option<Arc<dyn XaResource>>;

    /// Close the session
    async fn close(&self) -> Result<()>;
}

/// A message consumer bound to one destination
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Receive the next message, waiting up to `timeout`; `None` on timeout
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>>;

    async fn close(&self) -> Result<()>;
}

/// A message producer bound to one destination
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, message: &Message) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
