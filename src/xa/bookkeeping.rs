//! Shared xid and flag bookkeeping for the branch proxy strategies.
//!
//! Each branch proxy owns one [`BranchBook`]; the lock is never held across
//! an await.

use super::{XaError, Xid};
use parking_lot::Mutex;

/// Mutable branch state tracked across one physical delivery cycle
#[derive(Debug, Default, Clone)]
pub struct BranchFlags {
    /// The saved transaction id of the first real physical start
    pub saved_xid: Option<Xid>,
    /// A logical start was recorded but not yet forwarded
    pub start_recorded: bool,
    /// The physical `start` call was issued
    pub started: bool,
    /// The physical `end` call was issued
    pub end_called: bool,
    /// The branch is currently suspended (TMSUSPEND seen, no resume yet)
    pub suspended: bool,
    /// The physical `rollback` call was issued
    pub rolled_back: bool,
    /// Rollback of the not-yet-started branch is suppressed
    pub rollback_suppressed: bool,
}

/// Lock-protected branch bookkeeping shared by all strategies
#[derive(Debug, Default)]
pub struct BranchBook {
    state: Mutex<BranchFlags>,
}

impl BranchBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current flags
    pub fn flags(&self) -> BranchFlags {
        self.state.lock().clone()
    }

    /// Run a closure with mutable access to the flags
    pub fn update<R>(&self, f: impl FnOnce(&mut BranchFlags) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Remember the first xid seen; later xids do not replace it
    pub fn save_xid(&self, xid: &Xid) {
        let mut state = self.state.lock();
        if state.saved_xid.is_none() {
            state.saved_xid = Some(xid.clone());
        }
    }

    /// Resolve the xid for a physical call: the caller's xid when given,
    /// otherwise the saved one (dead-letter calls pass none)
    pub fn effective_xid(&self, xid: Option<&Xid>) -> Result<Xid, XaError> {
        match xid {
            Some(xid) => Ok(xid.clone()),
            None => self.state.lock().saved_xid.clone().ok_or_else(|| {
                XaError::no_transaction("no xid supplied and none saved from a prior start")
            }),
        }
    }

    /// Resolve the xid and remember it if it is the first one seen
    pub fn effective_xid_saving(&self, xid: Option<&Xid>) -> Result<Xid, XaError> {
        if let Some(xid) = xid {
            self.save_xid(xid);
        }
        self.effective_xid(xid)
    }

    pub fn end_called(&self) -> bool {
        self.state.lock().end_called
    }

    pub fn suppress_rollback(&self) {
        self.state.lock().rollback_suppressed = true;
    }

    pub fn allow_rollback(&self) {
        self.state.lock().rollback_suppressed = false;
    }
}
