//! The pooled delivery resource: one backend session, its transaction
//! branch, and the endpoint handle currently bound to it.

use crate::backend::{Consumer, Session};
use crate::endpoint::EndpointHandle;
use crate::xa::TransactionBranch;
use std::sync::Arc;
use tracing::{debug, warn};

/// One reusable delivery resource.
///
/// Exclusively owned by its current holder once acquired; no concurrent
/// access to the session or transaction branch is permitted. The consumer
/// and endpoint handle are bound lazily by the delivery path.
pub struct DeliveryResource {
    id: u64,
    session: Box<dyn Session>,
    branch: Option<Arc<dyn TransactionBranch>>,
    consumer: Option<Box<dyn Consumer>>,
    endpoint: Option<Box<dyn EndpointHandle>>,
}

impl DeliveryResource {
    pub fn new(
        id: u64,
        session: Box<dyn Session>,
        branch: Option<Arc<dyn TransactionBranch>>,
    ) -> Self {
        Self {
            id,
            session,
            branch,
            consumer: None,
            endpoint: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }

    pub fn branch(&self) -> Option<&Arc<dyn TransactionBranch>> {
        self.branch.as_ref()
    }

    pub fn consumer(&self) -> Option<&dyn Consumer> {
        self.consumer.as_deref()
    }

    pub fn set_consumer(&mut self, consumer: Box<dyn Consumer>) {
        self.consumer = Some(consumer);
    }

    pub fn endpoint_mut(&mut self) -> Option<&mut Box<dyn EndpointHandle>> {
        self.endpoint.as_mut()
    }

    pub fn set_endpoint(&mut self, endpoint: Box<dyn EndpointHandle>) {
        self.endpoint = Some(endpoint);
    }

    pub fn has_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Release the current endpoint handle back to the container, if any
    pub async fn release_endpoint(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.release().await;
        }
    }

    /// Tear the resource down. Teardown errors are logged and swallowed so
    /// the remaining resources still get destroyed.
    pub async fn destroy(mut self) {
        debug!(resource_id = self.id, "Destroying delivery resource");
        self.release_endpoint().await;
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.close().await {
                warn!(resource_id = self.id, error = %e, "Failed to close consumer during destroy");
            }
        }
        if let Err(e) = self.session.close().await {
            warn!(resource_id = self.id, error = %e, "Failed to close session during destroy");
        }
    }
}

impl std::fmt::Debug for DeliveryResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryResource")
            .field("id", &self.id)
            .field("transacted", &self.branch.is_some())
            .field("has_consumer", &self.consumer.is_some())
            .field("has_endpoint", &self.endpoint.is_some())
            .finish()
    }
}
