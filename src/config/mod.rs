//! # Activation Configuration
//!
//! Immutable per-deployment configuration for one inbound endpoint
//! activation. All configuration comes from explicit, validated values; there
//! are no silent fallbacks at delivery time - `validate()` rejects a bad
//! activation before any backend object is built.

pub mod loader;

pub use loader::ConfigLoader;

use crate::backend::DestinationKind;
use crate::error::{AdapterError, Result};
use crate::xa::{BranchStrategy, RmSharingPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delivery registration style, resolved once at validation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerMode {
    /// Backend-driven callback delivery (connection-consumer registration)
    Push,
    /// One dedicated receiver task per pooled session
    Pull,
}

/// Immutable configuration for one endpoint deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// Destination identity
    pub destination: String,

    /// Point-to-point or publish/subscribe delivery
    pub destination_kind: DestinationKind,

    /// Durable subscription flag (publish/subscribe only)
    pub durable: bool,

    /// Subscription name, required when durable
    pub subscription_name: Option<String>,

    /// Base message filter expression
    pub message_selector: Option<String>,

    /// Maximum number of pooled delivery resources
    pub pool_max_size: usize,

    /// Maximum time an acquirer waits for a free resource (milliseconds)
    pub max_wait_ms: u64,

    /// Redelivery attempts after a failed endpoint invocation
    pub redelivery_attempts: u32,

    /// Sleep between redelivery attempts (milliseconds)
    pub redelivery_interval_ms: u64,

    /// Reconnect attempts after a backend connection failure
    pub reconnect_attempts: u32,

    /// Sleep between reconnect attempts (milliseconds)
    pub reconnect_interval_ms: u64,

    /// Route exhausted messages to the dead-letter destination
    pub dead_letter_enabled: bool,

    /// Dead-letter destination name, required when enabled
    pub dead_letter_destination: Option<String>,

    /// Messages handed to one push-style dispatch
    pub batch_size: u32,

    /// Hold-until-ack mode: defer commit until an application-level ack
    pub hold_until_ack: bool,

    /// Acknowledgment timeout for hold-until-ack mode (milliseconds)
    pub ack_timeout_ms: u64,

    /// Number of clustered instances sharing the destination
    pub instance_count: u32,

    /// This instance's index within the cluster (0-based)
    pub instance_index: u32,

    /// Client identifier assigned to the backend connection
    pub client_id: Option<String>,

    /// Derive a unique per-instance client identifier from the base one
    pub derive_client_id: bool,

    /// Push or pull delivery registration
    pub consumer_mode: ConsumerMode,

    /// Resource-manager sharing policy for `is_same_rm`
    pub rm_sharing_policy: RmSharingPolicy,

    /// Transaction branch proxy strategy
    pub branch_strategy: BranchStrategy,

    /// Readiness-probe attempts before the pool serves acquisitions
    pub endpoint_probe_attempts: u32,

    /// Sleep between readiness-probe attempts (milliseconds)
    pub endpoint_probe_interval_ms: u64,

    /// Bound on waiting for in-use resources during pool stop (milliseconds)
    pub release_timeout_ms: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            destination_kind: DestinationKind::PointToPoint,
            durable: false,
            subscription_name: None,
            message_selector: None,
            pool_max_size: 15,
            max_wait_ms: 10_000,
            redelivery_attempts: 0,
            redelivery_interval_ms: 1_000,
            reconnect_attempts: 10,
            reconnect_interval_ms: 10_000,
            dead_letter_enabled: false,
            dead_letter_destination: None,
            batch_size: 1,
            hold_until_ack: false,
            ack_timeout_ms: 30_000,
            instance_count: 1,
            instance_index: 0,
            client_id: None,
            derive_client_id: false,
            consumer_mode: ConsumerMode::Pull,
            rm_sharing_policy: RmSharingPolicy::PerPhysicalConnection,
            branch_strategy: BranchStrategy::DelayedStart,
            endpoint_probe_attempts: 5,
            endpoint_probe_interval_ms: 2_000,
            release_timeout_ms: 30_000,
        }
    }
}

impl ActivationConfig {
    /// Validate the activation; errors are fatal at deployment
    pub fn validate(&self) -> Result<()> {
        if self.destination.is_empty() {
            return Err(AdapterError::configuration("destination cannot be empty"));
        }
        if self.pool_max_size == 0 {
            return Err(AdapterError::configuration(
                "pool max size must be greater than 0",
            ));
        }
        if self.instance_count == 0 {
            return Err(AdapterError::configuration(
                "instance count must be greater than 0",
            ));
        }
        if self.instance_index >= self.instance_count {
            return Err(AdapterError::configuration(format!(
                "instance index {} must be within instance count {}",
                self.instance_index, self.instance_count
            )));
        }
        if self.dead_letter_enabled && self.dead_letter_destination.is_none() {
            return Err(AdapterError::configuration(
                "dead-letter destination required when dead-letter handling is enabled",
            ));
        }
        if self.durable {
            if self.destination_kind != DestinationKind::PublishSubscribe {
                return Err(AdapterError::configuration(
                    "durable subscriptions require a publish/subscribe destination",
                ));
            }
            if self.subscription_name.is_none() {
                return Err(AdapterError::configuration(
                    "subscription name required for a durable subscription",
                ));
            }
        }
        if self.batch_size == 0 {
            return Err(AdapterError::configuration(
                "batch size must be greater than 0",
            ));
        }
        if self.hold_until_ack && self.ack_timeout_ms == 0 {
            return Err(AdapterError::configuration(
                "ack timeout must be greater than 0 in hold-until-ack mode",
            ));
        }
        Ok(())
    }

    /// Whether redelivery is configured for this activation
    pub fn redelivery_configured(&self) -> bool {
        self.redelivery_attempts > 0
    }

    /// Whether multi-instance load balancing applies
    pub fn load_balanced(&self) -> bool {
        self.instance_count > 1
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn redelivery_interval(&self) -> Duration {
        Duration::from_millis(self.redelivery_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn endpoint_probe_interval(&self) -> Duration {
        Duration::from_millis(self.endpoint_probe_interval_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}
