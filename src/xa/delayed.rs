//! Delayed-start branch proxy for redelivery with XA.

use super::bookkeeping::BranchBook;
use super::{RmSharingPolicy, TransactionBranch, XaError, XaResource, Xid, TMNOFLAGS, XA_RDONLY};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Branch proxy that defers the physical `start` until the delivery engine
/// explicitly invokes [`start_delayed`](TransactionBranch::start_delayed)
/// after a successful attempt.
///
/// Logical start/end calls issued before that point are recorded but not
/// forwarded. This is what allows N failed delivery attempts to occur
/// without creating N physical transaction branches: only the attempt that
/// finally succeeds (or the final exhausted attempt before dead-letter)
/// begins the real branch.
pub struct DelayedStartBranch {
    resource: Arc<dyn XaResource>,
    policy: RmSharingPolicy,
    book: BranchBook,
}

impl DelayedStartBranch {
    pub fn new(resource: Arc<dyn XaResource>, policy: RmSharingPolicy) -> Self {
        Self {
            resource,
            policy,
            book: BranchBook::new(),
        }
    }
}

#[async_trait]
impl TransactionBranch for DelayedStartBranch {
    async fn start(&self, xid: Option<&Xid>, _flags: u32) -> Result<(), XaError> {
        // Recorded, never forwarded: the physical start waits for
        // start_delayed(), and retries reuse the same physical branch.
        if let Some(xid) = xid {
            self.book.save_xid(xid);
        }
        self.book.update(|f| f.start_recorded = true);
        debug!("delayed branch: logical start recorded, physical start deferred");
        Ok(())
    }

    async fn end(&self, xid: Option<&Xid>, flags: u32) -> Result<(), XaError> {
        let flags_snapshot = self.book.flags();
        if !flags_snapshot.started {
            debug!("delayed branch: logical end before physical start, not forwarded");
            return Ok(());
        }
        if flags_snapshot.end_called {
            debug!("delayed branch: end already issued for this cycle");
            return Ok(());
        }
        let xid = self.book.effective_xid(xid)?;
        self.resource.end(&xid, flags).await?;
        self.book.update(|f| f.end_called = true);
        Ok(())
    }

    async fn prepare(&self, xid: Option<&Xid>) -> Result<i32, XaError> {
        if !self.book.flags().started {
            // Nothing was done under this branch; vote read-only
            debug!("delayed branch: prepare before physical start, voting read-only");
            return Ok(XA_RDONLY);
        }
        let xid = self.book.effective_xid(xid)?;
        self.resource.prepare(&xid).await
    }

    async fn commit(&self, xid: Option<&Xid>, one_phase: bool) -> Result<(), XaError> {
        if !self.book.flags().started {
            debug!("delayed branch: commit before physical start, nothing to commit");
            return Ok(());
        }
        let xid = self.book.effective_xid(xid)?;
        debug!(xid = %xid, one_phase, "delayed branch: forwarding commit");
        self.resource.commit(&xid, one_phase).await
    }

    async fn rollback(&self, xid: Option<&Xid>) -> Result<(), XaError> {
        let flags = self.book.flags();
        if !flags.started {
            // The failed attempts never started a physical branch, so there
            // is nothing to roll back.
            debug!(
                suppressed = flags.rollback_suppressed,
                "delayed branch: rollback before physical start, not forwarded"
            );
            return Ok(());
        }
        if flags.rolled_back {
            return Ok(());
        }
        let xid = self.book.effective_xid(xid)?;
        warn!(xid = %xid, "delayed branch: rolling back physical branch");
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

    /// A delayed-start branch never shares a resource manager: joining a
    /// branch whose start is deliberately deferred would corrupt the
    /// physical start ordering.
    fn is_same_rm(&self, _other: &dyn TransactionBranch) -> bool {
        false
    }

    fn is_delayed_start(&self) -> bool {
        true
    }

    fn sharing_policy(&self) -> RmSharingPolicy {
        self.policy
    }

    fn xa_resource(&self) -> Arc<dyn XaResource> {
        Arc::clone(&self.resource)
    }

    async fn start_delayed(&self) -> Result<(), XaError> {
        if self.book.flags().started {
            return Ok(());
        }
        let xid = self.book.effective_xid(None).map_err(|_| {
            XaError::protocol("start_delayed issued before any logical start recorded")
        })?;
        debug!(xid = %xid, "delayed branch: issuing deferred physical start");
        self.resource.start(&xid, TMNOFLAGS).await?;
        self.book.update(|f| f.started = true);
        Ok(())
    }

    fn suppress_rollback(&self) {
        self.book.suppress_rollback();
    }

    fn allow_rollback(&self) {
        self.book.allow_rollback();
    }

    fn end_called(&self) -> bool {
        self.book.end_called()
    }
}
