//! # XA Transaction Branch Proxying
//!
//! Two-phase-commit resource proxies that sit between the container's
//! transaction manager and the backend's physical XA resource. Their job is
//! to guarantee the redelivery invariant: the physical branch is started and
//! ended **at most once per physical delivery cycle**, no matter how many
//! logical start/end calls the container issues while the delivery engine
//! retries the same message.
//!
//! Three strategies share one contract and a small bookkeeping helper, with
//! no implementation inheritance:
//!
//! - [`SimpleBranch`]: transparent pass-through; remembers the first xid and
//!   substitutes it when the caller passes none.
//! - [`DelayedStartBranch`]: defers the physical `start` until the delivery
//!   engine calls `start_delayed()` after a successful attempt, so failed
//!   attempts never consume a physical branch.
//! - [`FirstPhysicalBranch`]: starts immediately and synthesizes join/resume
//!   flags across logical retries of the same physical xid, for providers
//!   that cannot support delayed start.

pub mod bookkeeping;
pub mod delayed;
pub mod first_physical;
pub mod simple;

pub use delayed::DelayedStartBranch;
pub use first_physical::FirstPhysicalBranch;
pub use simple::SimpleBranch;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// Standard XA flag values
pub const TMNOFLAGS: u32 = 0;
pub const TMJOIN: u32 = 0x0020_0000;
pub const TMENDRSCAN: u32 = 0x0080_0000;
pub const TMSTARTRSCAN: u32 = 0x0100_0000;
pub const TMSUSPEND: u32 = 0x0200_0000;
pub const TMSUCCESS: u32 = 0x0400_0000;
pub const TMRESUME: u32 = 0x0800_0000;
pub const TMFAIL: u32 = 0x2000_0000;
pub const TMONEPHASE: u32 = 0x4000_0000;

/// Vote returned by a successful `prepare`
pub const XA_OK: i32 = 0;
/// Vote returned by a read-only participant
pub const XA_RDONLY: i32 = 3;

/// A transaction branch identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub global_txn_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_txn_id: Vec<u8>, branch_qualifier: Vec<u8>) -> Self {
        Self {
            format_id,
            global_txn_id,
            branch_qualifier,
        }
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "xid({}:{}:{})",
            self.format_id,
            hex(&self.global_txn_id),
            hex(&self.branch_qualifier)
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Two-phase-commit faults
#[derive(Error, Debug)]
pub enum XaError {
    /// The branch was marked rollback-only (XA_RBROLLBACK)
    #[error("Transaction branch marked rollback-only")]
    RollbackOnly,

    /// Calls issued out of the legal XA state ordering (XAER_PROTO)
    #[error("XA protocol violation: {message}")]
    Protocol { message: String },

    /// No transaction id available for the call (XAER_NOTA)
    #[error("No transaction branch: {message}")]
    NoTransaction { message: String },

    /// Physical resource-manager failure (XAER_RMERR)
    #[error("Resource manager error: {message}")]
    ResourceManager { message: String },
}

impl XaError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn no_transaction(message: impl Into<String>) -> Self {
        Self::NoTransaction {
            message: message.into(),
        }
    }

    pub fn resource_manager(message: impl Into<String>) -> Self {
        Self::ResourceManager {
            message: message.into(),
        }
    }
}

/// The backend's physical two-phase-commit resource
///
/// Exactly one per transacted session; exclusively driven through a single
/// [`TransactionBranch`] proxy.
#[async_trait]
pub trait XaResource: Send + Sync {
    async fn start(&self, xid: &Xid, flags: u32) -> Result<(), XaError>;
    async fn end(&self, xid: &Xid, flags: u32) -> Result<(), XaError>;
    async fn prepare(&self, xid: &Xid) -> Result<i32, XaError>;
    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;
    async fn rollback(&self, xid: &Xid) -> Result<(), XaError>;
    async fn forget(&self, xid: &Xid) -> Result<(), XaError>;
    async fn recover(&self, flags: u32) -> Result<Vec<Xid>, XaError>;
    async fn set_transaction_timeout(&self, seconds: u32) -> Result<bool, XaError>;

    /// Stable identity of the physical connection this resource belongs to
    fn physical_connection_id(&self) -> u64;

    /// The provider's own same-resource-manager comparison
    fn same_rm(&self, other: &dyn XaResource) -> bool {
        self.physical_connection_id() == other.physical_connection_id()
    }
}

/// Policy for deciding when two branches share one resource manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RmSharingPolicy {
    /// One resource manager per physical connection: compare connection ids
    PerPhysicalConnection,
    /// Defer to the wrapped resource's own comparison
    Delegate,
}

/// Branch proxy strategy, selected once at configuration validation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStrategy {
    Simple,
    DelayedStart,
    FirstPhysical,
}

/// Logical transaction branch as seen by the container's transaction manager
///
/// Mirrors the standard two-phase-commit operations over a wrapped physical
/// [`XaResource`], plus the delivery-engine hooks (`start_delayed`,
/// `suppress_rollback`, `allow_rollback`, `end_called`). Every strategy gives
/// the hooks a safe default so the dead-letter path may call them on any
/// variant.
#[async_trait]
pub trait TransactionBranch: Send + Sync {
    async fn start(&self, xid: Option<&Xid>, flags: u32) -> Result<(), XaError>;
    async fn end(&self, xid: Option<&Xid>, flags: u32) -> Result<(), XaError>;
    async fn prepare(&self, xid: Option<&Xid>) -> Result<i32, XaError>;
    async fn commit(&self, xid: Option<&Xid>, one_phase: bool) -> Result<(), XaError>;
    async fn rollback(&self, xid: Option<&Xid>) -> Result<(), XaError>;
    async fn forget(&self, xid: Option<&Xid>) -> Result<(), XaError>;
    async fn recover(&self, flags: u32) -> Result<Vec<Xid>, XaError>;
    async fn set_transaction_timeout(&self, seconds: u32) -> Result<bool, XaError>;

    /// Same-resource-manager comparison between two logical branches.
    ///
    /// If either side defers its physical start the answer is always false:
    /// joining a branch whose start has been deliberately delayed would
    /// corrupt the physical start ordering.
    fn is_same_rm(&self, other: &dyn TransactionBranch) -> bool {
        if self.is_delayed_start() || other.is_delayed_start() {
            return false;
        }
        match self.sharing_policy() {
            RmSharingPolicy::PerPhysicalConnection => {
                self.xa_resource().physical_connection_id()
                    == other.xa_resource().physical_connection_id()
            }
            RmSharingPolicy::Delegate => self
                .xa_resource()
                .same_rm(other.xa_resource().as_ref()),
        }
    }

    /// Whether this branch defers its physical start
    fn is_delayed_start(&self) -> bool {
        false
    }

    /// The configured resource-manager sharing policy
    fn sharing_policy(&self) -> RmSharingPolicy;

    /// The wrapped physical resource
    fn xa_resource(&self) -> Arc<dyn XaResource>;

    /// Issue the deferred physical `start`, if this strategy delays it.
    /// Called by the delivery engine after a successful attempt (or before
    /// a dead-letter handoff). Safe no-op for non-delaying strategies.
    async fn start_delayed(&self) -> Result<(), XaError> {
        Ok(())
    }

    /// Mark the not-yet-started branch as not-to-be-rolled-back.
    /// Called on the redelivery failure path. Safe no-op by default.
    fn suppress_rollback(&self) {}

    /// Re-enable rollback after a successful attempt started the branch.
    /// Safe no-op by default.
    fn allow_rollback(&self) {}

    /// Whether a physical `end` has already been issued for this cycle
    fn end_called(&self) -> bool {
        false
    }
}
