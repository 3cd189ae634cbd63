//! Scriptable container endpoint with invocation recording.

use crate::backend::Message;
use crate::endpoint::{EndpointFactory, EndpointHandle};
use crate::error::{AdapterError, Result};
use crate::xa::TransactionBranch;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One recorded `on_message` invocation
#[derive(Debug, Clone)]
pub struct EndpointInvocation {
    pub message_id: String,
    pub redelivered: bool,
}

#[derive(Default)]
struct EndpointScript {
    /// Per-invocation outcomes; empty means every invocation succeeds
    outcomes: VecDeque<std::result::Result<(), String>>,
    /// Per-invocation ack answers for hold-until-ack; empty means acked
    acks: VecDeque<bool>,
    invocations: Vec<EndpointInvocation>,
}

/// Endpoint factory with scriptable per-attempt outcomes
pub struct MockEndpointFactory {
    transacted: bool,
    script: Arc<Mutex<EndpointScript>>,
    fail_creates: AtomicU32,
}

impl MockEndpointFactory {
    pub fn new(transacted: bool) -> Self {
        Self {
            transacted,
            script: Arc::new(Mutex::new(EndpointScript::default())),
            fail_creates: AtomicU32::new(0),
        }
    }

    /// Script the outcomes of the next `on_message` invocations
    pub fn script_outcomes(&self, outcomes: Vec<std::result::Result<(), String>>) {
        self.script.lock().outcomes = outcomes.into();
    }

    /// Script the answers of the next `await_ack` calls
    pub fn script_acks(&self, acks: Vec<bool>) {
        self.script.lock().acks = acks.into();
    }

    /// Fail the next `count` `create_endpoint` calls (`u32::MAX` = always)
    pub fn fail_next_creates(&self, count: u32) {
        self.fail_creates.store(count, Ordering::SeqCst);
    }

    /// Recorded `on_message` invocations, in order
    pub fn invocations(&self) -> Vec<EndpointInvocation> {
        self.script.lock().invocations.clone()
    }
}

#[async_trait]
impl EndpointFactory for MockEndpointFactory {
    async fn create_endpoint(
        &self,
        _branch: Option<Arc<dyn TransactionBranch>>,
    ) -> Result<Box<dyn EndpointHandle>> {
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
                return Err(AdapterError::delivery("endpoint not yet deployed"));
            }
        }
        Ok(Box::new(MockEndpointHandle {
            script: Arc::clone(&self.script),
        }))
    }

    fn is_delivery_transacted(&self) -> bool {
        self.transacted
    }
}

struct MockEndpointHandle {
    script: Arc<Mutex<EndpointScript>>,
}

#[async_trait]
impl EndpointHandle for MockEndpointHandle {
    async fn before_delivery(&mut self) -> Result<()> {
        Ok(())
    }

    async fn on_message(&mut self, message: &Message) -> Result<()> {
        let mut script = self.script.lock();
        script.invocations.push(EndpointInvocation {
            message_id: message.id.clone(),
            redelivered: message.redelivered,
        });
        match script.outcomes.pop_front() {
            Some(Ok(())) | None => Ok(()),
            Some(Err(reason)) => Err(AdapterError::delivery(reason)),
        }
    }

    async fn after_delivery(&mut self) -> Result<()> {
        Ok(())
    }

    async fn release(&mut self) {}

    async fn await_ack(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(self.script.lock().acks.pop_front().unwrap_or(true))
    }
}
