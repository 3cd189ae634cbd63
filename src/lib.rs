//! # mq-bridge - Inbound Messaging Resource Adapter
//!
//! Delivery engine bridging an external message-queue provider to
//! container-managed endpoints: a bounded pool of delivery sessions, a
//! redelivery state machine with dead-letter fallback, transaction branch
//! proxies that keep failed attempts from consuming physical XA branches,
//! and reconnect supervision over the physical connection.
//!
//! ## Architecture
//!
//! - **backend**: trait seam over the provider (connections, sessions,
//!   consumers, producers)
//! - **config**: validated per-activation configuration and the layered
//!   file/environment loader
//! - **pool**: bounded delivery resource pool with FIFO-fair blocking
//!   acquisition
//! - **delivery**: the per-message delivery/redelivery state machine and
//!   the dead-letter handoff
//! - **xa**: transaction branch proxy strategies over the provider's
//!   physical two-phase-commit resource
//! - **consumer**: lifecycle controller tying connection, pool, and
//!   receiver tasks together
//! - **reconnect**: connection-exception supervision and the restart loop
//!
//! ## Quick Start
//!
//! ```no_run
//! use mq_bridge::config::ActivationConfig;
//! use mq_bridge::consumer::ConsumerController;
//! use mq_bridge::context::AdapterContext;
//! # async fn example(context: AdapterContext) -> mq_bridge::error::Result<()> {
//! let config = ActivationConfig {
//!     destination: "orders".to_string(),
//!     redelivery_attempts: 3,
//!     ..ActivationConfig::default()
//! };
//! let controller = ConsumerController::new(config, context);
//! controller.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod consumer;
pub mod context;
pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod monitoring;
pub mod pool;
pub mod reconnect;
pub mod test_support;
pub mod xa;

pub use backend::{Destination, DestinationKind, Message};
pub use config::{ActivationConfig, ConsumerMode};
pub use consumer::ConsumerController;
pub use context::{AdapterContext, DestinationResolver};
pub use error::{AdapterError, Result};
