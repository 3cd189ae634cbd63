//! # Pool Monitoring Counters
//!
//! Read-only counter snapshot exposed to an external monitoring
//! collaborator. The delivery core only increments and decrements these
//! counters as acquire/release side effects.

use serde::{Deserialize, Serialize};

/// Point-in-time snapshot of one resource pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Resources currently in existence (busy + free)
    pub current_resources: usize,

    /// Resources held by an acquirer
    pub busy_resources: usize,

    /// Resources sitting idle in the pool
    pub free_resources: usize,

    /// Acquirers currently queued waiting for a resource
    pub waiting_count: usize,

    /// Configured pool capacity
    pub max_size: usize,

    /// Configured maximum acquisition wait in milliseconds
    pub max_wait_ms: u64,
}

impl PoolSnapshot {
    /// Whether the pool is at capacity with no free resources
    pub fn is_saturated(&self) -> bool {
        self.free_resources == 0 && self.current_resources >= self.max_size
    }
}
