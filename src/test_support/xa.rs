//! Recording physical XA resource for asserting branch call sequences.

use crate::xa::{XaError, XaResource, Xid};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// One recorded physical XA call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedXaCall {
    Start { xid: Xid, flags: u32 },
    End { xid: Xid, flags: u32 },
    Prepare { xid: Xid },
    Commit { xid: Xid, one_phase: bool },
    Rollback { xid: Xid },
    Forget { xid: Xid },
}

impl RecordedXaCall {
    /// The xid this call was issued with
    pub fn xid(&self) -> Option<Xid> {
        match self {
            Self::Start { xid, .. }
            | Self::End { xid, .. }
            | Self::Prepare { xid }
            | Self::Commit { xid, .. }
            | Self::Rollback { xid }
            | Self::Forget { xid } => Some(xid.clone()),
        }
    }
}

/// Physical XA resource that records every call it receives
pub struct RecordingXaResource {
    connection_id: u64,
    calls: Mutex<Vec<RecordedXaCall>>,
    fail_commit: AtomicBool,
    fail_prepare: AtomicBool,
}

impl RecordingXaResource {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            calls: Mutex::new(Vec::new()),
            fail_commit: AtomicBool::new(false),
            fail_prepare: AtomicBool::new(false),
        }
    }

    /// Snapshot of the recorded call sequence
    pub fn calls(&self) -> Vec<RecordedXaCall> {
        self.calls.lock().clone()
    }

    pub fn fail_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    pub fn fail_prepare(&self) {
        self.fail_prepare.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: RecordedXaCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl XaResource for RecordingXaResource {
    async fn start(&self, xid: &Xid, flags: u32) -> Result<(), XaError> {
        self.record(RecordedXaCall::Start {
            xid: xid.clone(),
            flags,
        });
        Ok(())
    }

    async fn end(&self, xid: &Xid, flags: u32) -> Result<(), XaError> {
        self.record(RecordedXaCall::End {
            xid: xid.clone(),
            flags,
        });
        Ok(())
    }

    async fn prepare(&self, xid: &Xid) -> Result<i32, XaError> {
        self.record(RecordedXaCall::Prepare { xid: xid.clone() });
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(XaError::resource_manager("scripted prepare failure"));
        }
        Ok(crate::xa::XA_OK)
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        self.record(RecordedXaCall::Commit {
            xid: xid.clone(),
            one_phase,
        });
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(XaError::resource_manager("scripted commit failure"));
        }
        Ok(())
    }

    async fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.record(RecordedXaCall::Rollback { xid: xid.clone() });
        Ok(())
    }

    async fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        self.record(RecordedXaCall::Forget { xid: xid.clone() });
        Ok(())
    }

    async fn recover(&self, _flags: u32) -> Result<Vec<Xid>, XaError> {
        Ok(Vec::new())
    }

    async fn set_transaction_timeout(&self, _seconds: u32) -> Result<bool, XaError> {
        Ok(true)
    }

    fn physical_connection_id(&self) -> u64 {
        self.connection_id
    }
}
