//! # Reconnect Supervision
//!
//! Listens for backend connection failures and drives the restart loop:
//! stop-and-restart the consumer controller up to the configured number of
//! attempts, sleeping the reconnect interval between tries. On exhaustion
//! the consumer is left stopped and the failure is logged; nothing ever
//! propagates back into the provider's callback.

use crate::backend::ExceptionListener;
use crate::config::ActivationConfig;
use crate::consumer::ConsumerController;
use crate::error::AdapterError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Exception listener registered on the backend connection.
///
/// Holds the controller weakly so a dropped controller simply cancels the
/// reconnect loop instead of keeping the whole activation alive.
pub struct ReconnectSupervisor {
    controller: Weak<ConsumerController>,
    config: Arc<ActivationConfig>,
    /// Collapses concurrent exception callbacks into one reconnect loop
    reconnecting: Arc<AtomicBool>,
}

impl ReconnectSupervisor {
    pub fn new(controller: Weak<ConsumerController>, config: Arc<ActivationConfig>) -> Self {
        Self {
            controller,
            config,
            reconnecting: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ExceptionListener for ReconnectSupervisor {
    fn on_connection_exception(&self, error: AdapterError) {
        error!(
            destination = %self.config.destination,
            error = %error,
            "Backend connection failure reported"
        );

        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already in progress, ignoring duplicate exception");
            return;
        }

        let controller = self.controller.clone();
        let config = Arc::clone(&self.config);
        let reconnecting = Arc::clone(&self.reconnecting);
        tokio::spawn(async move {
            run_reconnect(controller, config).await;
            reconnecting.store(false, Ordering::SeqCst);
        });
    }
}

async fn run_reconnect(controller: Weak<ConsumerController>, config: Arc<ActivationConfig>) {
    let max_attempts = config.reconnect_attempts.max(1);

    for attempt in 1..=max_attempts {
        let Some(controller) = controller.upgrade() else {
            debug!("Consumer controller dropped, abandoning reconnect");
            return;
        };

        info!(
            attempt,
            max_attempts,
            destination = %config.destination,
            "🔄 Attempting backend reconnect"
        );
        match controller.restart().await {
            Ok(()) => {
                info!(attempt, destination = %config.destination, "✅ Backend reconnect succeeded");
                return;
            }
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "Reconnect attempt failed");
            }
        }
        drop(controller);

        if attempt < max_attempts {
            tokio::time::sleep(config.reconnect_interval()).await;
        }
    }

    // Exhausted: leave nothing half-started behind
    if let Some(controller) = controller.upgrade() {
        controller.stop().await;
    }
    error!(
        attempts = max_attempts,
        destination = %config.destination,
        "Reconnect attempts exhausted, consumer left stopped"
    );
}
