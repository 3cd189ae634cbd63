//! Dead-letter handoff for messages that exhaust redelivery.

use crate::backend::{Connection, Destination, Message};
use crate::error::{AdapterError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Property stamped with the original destination name
pub const PROP_ORIGINAL_DESTINATION: &str = "MQB_ORIG_DESTINATION";
/// Property stamped with the original message id
pub const PROP_ORIGINAL_MESSAGE_ID: &str = "MQB_ORIG_MESSAGE_ID";
/// Property stamped with the number of failed delivery attempts
pub const PROP_DELIVERY_ATTEMPTS: &str = "MQB_DELIVERY_ATTEMPTS";
/// Property stamped with the handoff time (RFC 3339)
pub const PROP_DEAD_LETTER_TIME: &str = "MQB_DEAD_LETTER_TIME";

/// Delivers a poison message to the configured fallback destination using
/// its own short-lived session.
pub struct DeadLetterSender {
    connection: Arc<dyn Connection>,
    destination: Destination,
}

impl DeadLetterSender {
    pub fn new(connection: Arc<dyn Connection>, destination: Destination) -> Self {
        Self {
            connection,
            destination,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Send the message to the dead-letter destination, stamped with
    /// diagnostic properties. The session lives only for this send.
    pub async fn send(&self, original: &Message, attempts: u32) -> Result<()> {
        debug!(
            message_id = %original.id,
            dead_letter_destination = %self.destination.name,
            attempts,
            "Sending message to dead-letter destination"
        );

        let session = self.connection.create_session(false).await?;
        let producer = session.create_producer(&self.destination).await?;

        let mut dead = original.clone();
        dead.destination = self.destination.clone();
        dead.redelivered = false;
        dead.properties.insert(
            PROP_ORIGINAL_DESTINATION.to_string(),
            original.destination.name.clone(),
        );
        dead.properties
            .insert(PROP_ORIGINAL_MESSAGE_ID.to_string(), original.id.clone());
        dead.properties
            .insert(PROP_DELIVERY_ATTEMPTS.to_string(), attempts.to_string());
        dead.properties.insert(
            PROP_DEAD_LETTER_TIME.to_string(),
            chrono::Utc::now().to_rfc3339(),
        );

        let sent = producer.send(&dead).await;

        if let Err(e) = producer.close().await {
            warn!(error = %e, "Failed to close dead-letter producer");
        }
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close dead-letter session");
        }

        sent.map_err(|e| {
            AdapterError::dead_letter(format!(
                "send to {} failed: {e}",
                self.destination.name
            ))
        })
    }
}
