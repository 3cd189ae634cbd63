//! Immediate-start branch proxy for providers without delayed-start support.

use super::bookkeeping::BranchBook;
use super::{
    RmSharingPolicy, TransactionBranch, XaError, XaResource, Xid, TMJOIN, TMNOFLAGS, TMRESUME,
    TMSUSPEND,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Branch proxy that issues the physical `start` immediately on the first
/// logical start and synthesizes TMJOIN/TMRESUME flags for every subsequent
/// logical start of the same physical xid.
///
/// Used for providers whose resource manager cannot tolerate a deferred
/// start: the first physical branch stays open across the logical retries of
/// one delivery cycle, with suspend/resume and rollback state tracked
/// explicitly.
pub struct FirstPhysicalBranch {
    resource: Arc<dyn XaResource>,
    policy: RmSharingPolicy,
    book: BranchBook,
}

impl FirstPhysicalBranch {
    pub fn new(resource: Arc<dyn XaResource>, policy: RmSharingPolicy) -> Self {
        Self {
            resource,
            policy,
            book: BranchBook::new(),
        }
    }
}

#[async_trait]
impl TransactionBranch for FirstPhysicalBranch {
    async fn start(&self, xid: Option<&Xid>, _flags: u32) -> Result<(), XaError> {
        let xid = self.book.effective_xid_saving(xid)?;
        let flags = self.book.flags();

        if !flags.started {
            debug!(xid = %xid, "first-physical branch: issuing physical start");
            self.resource.start(&xid, TMNOFLAGS).await?;
            self.book.update(|f| {
                f.started = true;
                f.start_recorded = true;
            });
            return Ok(());
        }

        if flags.rolled_back {
            return Err(XaError::protocol(
                "logical start after the physical branch was rolled back",
            ));
        }

        // Retries of the same physical id: resume if suspended, else join
        let synthesized = if flags.suspended { TMRESUME } else { TMJOIN };
        debug!(
            xid = %xid,
            resume = flags.suspended,
            "first-physical branch: synthesizing start flags for logical retry"
        );
        self.resource.start(&xid, synthesized).await?;
        self.book.update(|f| f.suspended = false);
        Ok(())
    }

    async fn end(&self, xid: Option<&Xid>, flags: u32) -> Result<(), XaError> {
        let xid = self.book.effective_xid(xid)?;
        self.resource.end(&xid, flags).await?;
        self.book.update(|f| {
            if flags & TMSUSPEND != 0 {
                f.suspended = true;
            } else {
                f.end_called = true;
            }
        });
        Ok(())
    }

    async fn prepare(&self, xid: Option<&Xid>) -> Result<i32, XaError> {
        let xid = self.book.effective_xid(xid)?;
        self.resource.prepare(&xid).await
    }

    async fn commit(&self, xid: Option<&Xid>, one_phase: bool) -> Result<(), XaError> {
        if self.book.flags().rolled_back {
            return Err(XaError::RollbackOnly);
        }
        let xid = self.book.effective_xid(xid)?;
        debug!(xid = %xid, one_phase, "first-physical branch: forwarding commit");
        self.resource.commit(&xid, one_phase).await
    }

    async fn rollback(&self, xid: Option<&Xid>) -> Result<(), XaError> {
        let flags = self.book.flags();
        if flags.rolled_back {
            return Ok(());
        }
        if flags.rollback_suppressed && !flags.end_called {
            // Mid-retry rollback of the still-open cycle is swallowed so the
            // next attempt can reuse the same physical branch.
            debug!("first-physical branch: rollback suppressed during retry cycle");
            return Ok(());
        }
        let xid = self.book.effective_xid(xid)?;
        warn!(xid = %xid, "first-physical branch: rolling back physical branch");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordedXaCall, RecordingXaResource};
    use crate::xa::{DelayedStartBranch, TMSUCCESS};

    fn xid(n: u8) -> Xid {
        Xid::new(1, vec![n], vec![n])
    }

    #[tokio::test]
    async fn test_first_start_is_physical_retries_join() {
        let resource = Arc::new(RecordingXaResource::new(1));
        let branch =
            FirstPhysicalBranch::new(resource.clone(), RmSharingPolicy::PerPhysicalConnection);

        branch.start(Some(&xid(1)), TMNOFLAGS).await.unwrap();
        branch.start(Some(&xid(1)), TMNOFLAGS).await.unwrap();
        branch.start(Some(&xid(1)), TMNOFLAGS).await.unwrap();

        let calls = resource.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], RecordedXaCall::Start { flags, .. } if flags == TMNOFLAGS));
        assert!(matches!(calls[1], RecordedXaCall::Start { flags, .. } if flags == TMJOIN));
        assert!(matches!(calls[2], RecordedXaCall::Start { flags, .. } if flags == TMJOIN));
    }

    #[tokio::test]
    async fn test_suspend_then_resume() {
        let resource = Arc::new(RecordingXaResource::new(1));
        let branch =
            FirstPhysicalBranch::new(resource.clone(), RmSharingPolicy::PerPhysicalConnection);

        branch.start(Some(&xid(1)), TMNOFLAGS).await.unwrap();
        branch.end(Some(&xid(1)), TMSUSPEND).await.unwrap();
        assert!(!branch.end_called());
        branch.start(Some(&xid(1)), TMNOFLAGS).await.unwrap();

        let calls = resource.calls();
        assert!(matches!(calls[2], RecordedXaCall::Start { flags, .. } if flags == TMRESUME));
    }

    #[tokio::test]
    async fn test_suppressed_rollback_is_swallowed_mid_cycle() {
        let resource = Arc::new(RecordingXaResource::new(1));
        let branch =
            FirstPhysicalBranch::new(resource.clone(), RmSharingPolicy::PerPhysicalConnection);

        branch.start(Some(&xid(1)), TMNOFLAGS).await.unwrap();
        branch.suppress_rollback();
        branch.rollback(Some(&xid(1))).await.unwrap();

        // No physical rollback was issued; the cycle can continue
        assert_eq!(resource.calls().len(), 1);
        branch.start(Some(&xid(1)), TMNOFLAGS).await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_after_end_is_forwarded() {
        let resource = Arc::new(RecordingXaResource::new(1));
        let branch =
            FirstPhysicalBranch::new(resource.clone(), RmSharingPolicy::PerPhysicalConnection);

        branch.start(Some(&xid(1)), TMNOFLAGS).await.unwrap();
        branch.end(Some(&xid(1)), TMSUCCESS).await.unwrap();
        branch.rollback(Some(&xid(1))).await.unwrap();

        let calls = resource.calls();
        assert!(matches!(calls[2], RecordedXaCall::Rollback { .. }));
        assert!(matches!(
            branch.commit(Some(&xid(1)), false).await,
            Err(XaError::RollbackOnly)
        ));
    }

    #[tokio::test]
    async fn test_same_rm_against_delayed_is_false() {
        let shared = Arc::new(RecordingXaResource::new(3));
        let first =
            FirstPhysicalBranch::new(shared.clone(), RmSharingPolicy::PerPhysicalConnection);
        let delayed = DelayedStartBranch::new(shared, RmSharingPolicy::PerPhysicalConnection);
        assert!(!first.is_same_rm(&delayed));
    }

    #[tokio::test]
    async fn test_same_rm_delegates_to_resource_when_configured() {
        let a = FirstPhysicalBranch::new(
            Arc::new(RecordingXaResource::new(5)),
            RmSharingPolicy::Delegate,
        );
        let b = FirstPhysicalBranch::new(
            Arc::new(RecordingXaResource::new(5)),
            RmSharingPolicy::Delegate,
        );
        // RecordingXaResource delegates to physical-connection identity
        assert!(a.is_same_rm(&b));
    }
}
