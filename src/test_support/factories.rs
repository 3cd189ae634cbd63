//! Simple resource factories for pool-focused tests.

use super::broker::MockBroker;
use crate::error::{AdapterError, Result};
use crate::pool::{DeliveryResource, ResourceFactory};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Resource factory backed by a private broker, counting every creation
pub struct CountingResourceFactory {
    broker: Arc<MockBroker>,
    created: AtomicUsize,
    fail_creates: AtomicU32,
    create_delay_ms: AtomicU64,
}

impl CountingResourceFactory {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            broker: MockBroker::new(),
            created: AtomicUsize::new(0),
            fail_creates: AtomicU32::new(0),
            create_delay_ms: AtomicU64::new(0),
        }
    }

    /// Number of resources created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Fail the next `count` `create_resource` calls (`u32::MAX` = always)
    pub fn fail_next_creates(&self, count: u32) {
        self.fail_creates.store(count, Ordering::SeqCst);
    }

    /// Stall every `create_resource` call for `delay` before it resolves
    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceFactory for CountingResourceFactory {
    async fn create_resource(&self, id: u64) -> Result<DeliveryResource> {
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        loop {
            let current = self.fail_creates.load(Ordering::SeqCst);
            if current == 0 {
                break;
            }
            let next = if current == u32::MAX { current } else { current - 1 };
            if self
                .fail_creates
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(AdapterError::connection("scripted resource failure"));
            }
        }
        let connection = self.broker.connect().await;
        let session = connection.create_session(false).await?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(DeliveryResource::new(id, session, None))
    }
}
