//! # Delivery Engine
//!
//! The per-message delivery/redelivery state machine and the dead-letter
//! handoff it falls back to when attempts are exhausted.

pub mod coordinator;
pub mod dead_letter;

pub use coordinator::DeliveryCoordinator;
pub use dead_letter::{
    DeadLetterSender, PROP_DEAD_LETTER_TIME, PROP_DELIVERY_ATTEMPTS, PROP_ORIGINAL_DESTINATION,
    PROP_ORIGINAL_MESSAGE_ID,
};
