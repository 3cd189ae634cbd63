//! Pass-through branch proxy for deployments without redelivery.

use super::bookkeeping::BranchBook;
use super::{RmSharingPolicy, TransactionBranch, XaError, XaResource, Xid};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Transparent 1:1 proxy over the physical resource.
///
/// Each logical call maps directly to the physical call, with the single
/// remembered transaction id substituted whenever the caller passes none
/// (the dead-letter sender issues its calls with a null id). The
/// delivery-engine hooks are safe no-ops, so the dead-letter path may drive
/// this variant like any other.
pub struct SimpleBranch {
    resource: Arc<dyn XaResource>,
    policy: RmSharingPolicy,
    book: BranchBook,
}

impl SimpleBranch {
    pub fn new(resource: Arc<dyn XaResource>, policy: RmSharingPolicy) -> Self {
        Self {
            resource,
            policy,
            book: BranchBook::new(),
        }
    }
}

#[async_trait]
impl TransactionBranch for SimpleBranch {
    async fn start(&self, xid: Option<&Xid>, flags: u32) -> Result<(), XaError> {
        let xid = self.book.effective_xid_saving(xid)?;
        debug!(xid = %xid, flags, "simple branch: forwarding start");
        self.resource.start(&xid, flags).await?;
        self.book.update(|f| f.started = true);
        Ok(())
    }

    async fn end(&self, xid: Option<&Xid>, flags: u32) -> Result<(), XaError> {
        let xid = self.book.effective_xid(xid)?;
        debug!(xid = %xid, flags, "simple branch: forwarding end");
        self.resource.end(&xid, flags).await?;
        self.book.update(|f| f.end_called = true);
        Ok(())
    }

    async fn prepare(&self, xid: Option<&Xid>) -> Result<i32, XaError> {
        let xid = self.book.effective_xid(xid)?;
        self.resource.prepare(&xid).await
    }

    async fn commit(&self, xid: Option<&Xid>, one_phase: bool) -> Result<(), XaError> {
        let xid = self.book.effective_xid(xid)?;
        debug!(xid = %xid, one_phase, "simple branch: forwarding commit");
        self.resource.commit(&xid, one_phase).await
    }

    async fn rollback(&self, xid: Option<&Xid>) -> Result<(), XaError> {
        let xid = self.book.effective_xid(xid)?;
        debug!(xid = %xid, "simple branch: forwarding rollback");
        self.resource.rollback(&xid).await?;
        self.book.update(|f| f.rolled_back = true);
        Ok(())
    }

    async fn forget(&self, xid: Option<&Xid>) -> Result<(), XaError> {
        let xid = self.book.effective_xid(xid)?;
        self.resource.forget(&xid).await
    }

    async fn recover(&self, flags: u32) -> Result<Vec<Xid>, XaError> {
        self.resource.recover(flags).await
    }

    async fn set_transaction_timeout(&self, seconds: u32) -> Result<bool, XaError> {
        self.resource.set_transaction_timeout(seconds).await
    }

    fn sharing_policy(&self) -> RmSharingPolicy {
        self.policy
    }

    fn xa_resource(&self) -> Arc<dyn XaResource> {
        Arc::clone(&self.resource)
    }

    fn end_called(&self) -> bool {
        self.book.end_called()
    }
}
