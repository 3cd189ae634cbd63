//! # Container Endpoint Abstraction
//!
//! Trait seam over the container-managed message endpoint. The delivery
//! engine obtains a fresh handle per delivery cycle (and per redelivery
//! refresh), drives `before_delivery` / `on_message` / `after_delivery`,
//! and releases the handle when the resource goes back to the pool.

use crate::backend::Message;
use crate::error::Result;
use crate::xa::TransactionBranch;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Factory for endpoint handles, supplied by the embedding container
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    /// Create an endpoint handle, enlisting the transaction branch when the
    /// delivery is transacted
    async fn create_endpoint(
        &self,
        branch: Option<Arc<dyn TransactionBranch>>,
    ) -> Result<Box<dyn EndpointHandle>>;

    /// Whether endpoint invocations run inside a container transaction
    fn is_delivery_transacted(&self) -> bool;
}

/// One endpoint handle, valid for a single delivery cycle
#[async_trait]
pub trait EndpointHandle: Send + Sync {
    /// Called before the message-handling entry point
    async fn before_delivery(&mut self) -> Result<()>;

    /// The message-handling entry point
    async fn on_message(&mut self, message: &Message) -> Result<()>;

    /// Called after the message-handling entry point
    async fn after_delivery(&mut self) -> Result<()>;

    /// Return the handle to the container
    async fn release(&mut self);

    /// Wait for an application-level acknowledgment, bounded by `timeout`.
    ///
    /// Only consulted in hold-until-ack mode. Returns `Ok(false)` when no
    /// acknowledgment arrived within the timeout. The default assumes the
    /// endpoint acknowledges implicitly.
    async fn await_ack(&mut self, timeout: Duration) -> Result<bool> {
        let _ = timeout;
        Ok(true)
    }
}
