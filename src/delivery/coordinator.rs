//! The per-message delivery state machine.

use super::dead_letter::DeadLetterSender;
use crate::backend::Message;
use crate::config::ActivationConfig;
use crate::endpoint::EndpointFactory;
use crate::error::{AdapterError, Result};
use crate::pool::DeliveryResource;
use crate::xa::TMSUCCESS;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Owns one message's delivery lifecycle: invoke the endpoint, interpret
/// success/failure, drive the retry loop with its backpressure sleep, decide
/// the dead-letter handoff, and step the transaction branch through its
/// delayed-start/rollback transitions.
///
/// Redelivery attempts sleep the calling worker task for the configured
/// interval; that is deliberate backpressure against a failing endpoint,
/// not asynchronous scheduling.
pub struct DeliveryCoordinator {
    config: Arc<ActivationConfig>,
    endpoint_factory: Arc<dyn EndpointFactory>,
    dead_letter: Option<Arc<DeadLetterSender>>,
}

impl DeliveryCoordinator {
    pub fn new(
        config: Arc<ActivationConfig>,
        endpoint_factory: Arc<dyn EndpointFactory>,
        dead_letter: Option<Arc<DeadLetterSender>>,
    ) -> Self {
        Self {
            config,
            endpoint_factory,
            dead_letter,
        }
    }

    /// Deliver one message through the given resource.
    ///
    /// Returns `Ok(())` on success, and also after a swallowed non-transacted
    /// failure; returns a delivery error only when the delivery is transacted
    /// and attempts are exhausted, so the container reports a still-failed
    /// delivery and the backend's retained-message semantics apply.
    pub async fn deliver(&self, resource: &mut DeliveryResource, message: Message) -> Result<()> {
        let transacted = self.endpoint_factory.is_delivery_transacted();
        let redelivery = self.config.redelivery_configured() && resource.branch().is_some();
        let max_attempts = if redelivery {
            self.config.redelivery_attempts
        } else {
            1
        };

        let mut message = message;
        let mut failures: u32 = 0;
        let mut route_to_dead_letter = false;

        let failure = loop {
            self.ensure_endpoint(resource).await?;

            match self.invoke_endpoint(resource, &message).await {
                Ok(()) => {
                    if redelivery {
                        if let Some(branch) = resource.branch() {
                            // Success is what finally begins the real branch
                            branch.start_delayed().await?;
                            branch.allow_rollback();
                        }
                    }
                    debug!(
                        message_id = %message.id,
                        attempt = failures + 1,
                        "✅ Message delivered to endpoint"
                    );
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        message_id = %message.id,
                        attempt = failures,
                        max_attempts,
                        error = %e,
                        "Endpoint invocation failed"
                    );

                    if redelivery && failures < max_attempts {
                        if let Some(branch) = resource.branch() {
                            // The branch has not physically started; a
                            // container-issued rollback must not touch it
                            branch.suppress_rollback();
                        }
                        message.redelivered = true;
                        resource.release_endpoint().await;
                        debug!(
                            message_id = %message.id,
                            interval_ms = self.config.redelivery_interval_ms,
                            "Sleeping before redelivery attempt"
                        );
                        tokio::time::sleep(self.config.redelivery_interval()).await;
                        continue;
                    }

                    // Exhausted, or redelivery not configured
                    message.redelivered = false;
                    if self.config.dead_letter_enabled && self.dead_letter.is_some() {
                        route_to_dead_letter = true;
                        if redelivery {
                            if let Some(branch) = resource.branch() {
                                // Start the deferred branch so the dead-letter
                                // send happens under it
                                if let Err(xa_err) = branch.start_delayed().await {
                                    warn!(
                                        message_id = %message.id,
                                        error = %xa_err,
                                        "Could not start deferred branch before dead-letter handoff"
                                    );
                                }
                            }
                        }
                    }
                    break e;
                }
            }
        };

        if route_to_dead_letter {
            self.hand_off_to_dead_letter(resource, &message, failures, redelivery)
                .await;
        }

        if transacted {
            Err(AdapterError::delivery(format!(
                "message {} failed after {failures} attempt(s): {failure}",
                message.id
            )))
        } else {
            // The backend's acknowledgment mode considers the message
            // consumed either way
            debug!(
                message_id = %message.id,
                "Non-transacted delivery failure swallowed after logging"
            );
            Ok(())
        }
    }

    /// Obtain a fresh endpoint handle when the resource has none (first
    /// attempt, or after a retry released the previous handle)
    async fn ensure_endpoint(&self, resource: &mut DeliveryResource) -> Result<()> {
        if !resource.has_endpoint() {
            let branch = resource.branch().cloned();
            let endpoint = self.endpoint_factory.create_endpoint(branch).await?;
            resource.set_endpoint(endpoint);
        }
        Ok(())
    }

    async fn invoke_endpoint(
        &self,
        resource: &mut DeliveryResource,
        message: &Message,
    ) -> Result<()> {
        let hold_until_ack = self.config.hold_until_ack;
        let ack_timeout = self.config.ack_timeout();

        let endpoint = resource
            .endpoint_mut()
            .ok_or_else(|| AdapterError::delivery("no endpoint handle bound to resource"))?;

        endpoint.before_delivery().await?;
        let outcome = endpoint.on_message(message).await;
        if let Err(e) = endpoint.after_delivery().await {
            warn!(message_id = %message.id, error = %e, "after_delivery failed");
            if outcome.is_ok() {
                return Err(e);
            }
        }
        outcome?;

        if hold_until_ack {
            let acked = endpoint.await_ack(ack_timeout).await?;
            if !acked {
                return Err(AdapterError::delivery(format!(
                    "no acknowledgment within {}ms in hold-until-ack mode",
                    self.config.ack_timeout_ms
                )));
            }
        }
        Ok(())
    }

    /// Send the message to the dead-letter destination under the same
    /// transaction branch: end (if not already ended) → prepare → send →
    /// commit. Failures are logged; the non-redelivery path also rolls the
    /// branch back so no prepared transaction is orphaned.
    async fn hand_off_to_dead_letter(
        &self,
        resource: &mut DeliveryResource,
        message: &Message,
        attempts: u32,
        redelivery: bool,
    ) {
        let Some(sender) = &self.dead_letter else {
            return;
        };

        let result: Result<()> = async {
            if let Some(branch) = resource.branch() {
                if !branch.end_called() {
                    branch.end(None, TMSUCCESS).await?;
                }
                branch.prepare(None).await?;
                sender.send(message, attempts).await?;
                branch.commit(None, false).await?;
            } else {
                sender.send(message, attempts).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => info!(
                message_id = %message.id,
                attempts,
                dead_letter_destination = %sender.destination().name,
                "📮 Message routed to dead-letter destination"
            ),
            Err(e) => {
                error!(
                    message_id = %message.id,
                    error = %e,
                    "Dead-letter handoff failed"
                );
                if !redelivery {
                    if let Some(branch) = resource.branch() {
                        if let Err(rb) = branch.rollback(None).await {
                            warn!(
                                message_id = %message.id,
                                error = %rb,
                                "Rollback after failed dead-letter handoff also failed"
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Destination;
    use crate::pool::DeliveryResource;
    use crate::test_support::{
        MockBroker, MockEndpointFactory, RecordedXaCall, RecordingXaResource,
    };
    use crate::xa::{
        DelayedStartBranch, RmSharingPolicy, SimpleBranch, TransactionBranch, Xid, TMNOFLAGS,
    };

    fn test_config(redelivery_attempts: u32, interval_ms: u64) -> Arc<ActivationConfig> {
        Arc::new(ActivationConfig {
            destination: "orders".to_string(),
            redelivery_attempts,
            redelivery_interval_ms: interval_ms,
            ..ActivationConfig::default()
        })
    }

    fn test_message(id: &str) -> Message {
        Message::new(id, Destination::queue("orders"), serde_json::json!({"n": 1}))
    }

    async fn transacted_resource(
        broker: &Arc<MockBroker>,
        xa: Arc<RecordingXaResource>,
    ) -> DeliveryResource {
        let connection = broker.connect().await;
        let session = connection.create_session(true).await.unwrap();
        let branch: Arc<dyn TransactionBranch> = Arc::new(DelayedStartBranch::new(
            xa,
            RmSharingPolicy::PerPhysicalConnection,
        ));
        // Simulate the container's transaction manager enlisting the branch
        branch
            .start(Some(&Xid::new(1, vec![1], vec![1])), TMNOFLAGS)
            .await
            .unwrap();
        DeliveryResource::new(0, session, Some(branch))
    }

    #[tokio::test]
    async fn test_success_on_final_attempt_starts_branch_exactly_once() {
        let broker = MockBroker::new();
        let xa = Arc::new(RecordingXaResource::new(1));
        let mut resource = transacted_resource(&broker, xa.clone()).await;

        let factory = Arc::new(MockEndpointFactory::new(true));
        factory.script_outcomes(vec![
            Err("boom 1".to_string()),
            Err("boom 2".to_string()),
            Ok(()),
        ]);

        let coordinator = DeliveryCoordinator::new(test_config(3, 0), factory.clone(), None);
        coordinator
            .deliver(&mut resource, test_message("m-1"))
            .await
            .unwrap();

        // Endpoint invoked three times, exactly one physical start, issued
        // only after the successful attempt
        assert_eq!(factory.invocations().len(), 3);
        let starts: Vec<_> = xa
            .calls()
            .into_iter()
            .filter(|c| matches!(c, RecordedXaCall::Start { .. }))
            .collect();
        assert_eq!(starts.len(), 1);

        // Retry attempts carried the redelivered flag
        let invocations = factory.invocations();
        assert!(!invocations[0].redelivered);
        assert!(invocations[1].redelivered);
        assert!(invocations[2].redelivered);
    }

    #[tokio::test]
    async fn test_failed_attempts_do_not_touch_the_physical_branch() {
        let broker = MockBroker::new();
        let xa = Arc::new(RecordingXaResource::new(1));
        let mut resource = transacted_resource(&broker, xa.clone()).await;

        let factory = Arc::new(MockEndpointFactory::new(true));
        factory.script_outcomes(vec![Err("a".into()), Err("b".into()), Err("c".into())]);

        let coordinator = DeliveryCoordinator::new(test_config(3, 0), factory.clone(), None);
        let result = coordinator.deliver(&mut resource, test_message("m-2")).await;

        assert!(matches!(result, Err(AdapterError::Delivery { .. })));
        assert_eq!(factory.invocations().len(), 3);
        // No dead letter configured, no physical branch activity at all
        assert!(xa.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_attempts_route_to_dead_letter_exactly_once() {
        let broker = MockBroker::new();
        let xa = Arc::new(RecordingXaResource::new(1));
        let mut resource = transacted_resource(&broker, xa.clone()).await;

        let factory = Arc::new(MockEndpointFactory::new(true));
        factory.script_outcomes(vec![Err("a".into()), Err("b".into())]);

        let config = Arc::new(ActivationConfig {
            destination: "orders".to_string(),
            redelivery_attempts: 2,
            redelivery_interval_ms: 0,
            dead_letter_enabled: true,
            dead_letter_destination: Some("orders.dlq".to_string()),
            ..ActivationConfig::default()
        });
        let sender = Arc::new(DeadLetterSender::new(
            broker.connect().await,
            Destination::queue("orders.dlq"),
        ));
        let coordinator = DeliveryCoordinator::new(config, factory.clone(), Some(sender));

        let result = coordinator.deliver(&mut resource, test_message("m-3")).await;

        // Still reported as failed to the container
        assert!(matches!(result, Err(AdapterError::Delivery { .. })));
        // Exactly one dead-letter send
        assert_eq!(broker.sent_messages("orders.dlq").len(), 1);
        // The deferred branch was started for the handoff and driven through
        // end → prepare → commit
        let calls = xa.calls();
        assert!(matches!(calls[0], RecordedXaCall::Start { .. }));
        assert!(matches!(calls[1], RecordedXaCall::End { .. }));
        assert!(matches!(calls[2], RecordedXaCall::Prepare { .. }));
        assert!(matches!(calls[3], RecordedXaCall::Commit { .. }));
    }

    #[tokio::test]
    async fn test_failed_handoff_prepare_rolls_back_without_redelivery() {
        let broker = MockBroker::new();
        let xa = Arc::new(RecordingXaResource::new(1));
        xa.fail_prepare();

        // Pass-through branch: redelivery is not configured on this path
        let connection = broker.connect().await;
        let session = connection.create_session(true).await.unwrap();
        let branch: Arc<dyn TransactionBranch> = Arc::new(SimpleBranch::new(
            xa.clone(),
            RmSharingPolicy::PerPhysicalConnection,
        ));
        branch
            .start(Some(&Xid::new(1, vec![1], vec![1])), TMNOFLAGS)
            .await
            .unwrap();
        let mut resource = DeliveryResource::new(0, session, Some(branch));

        let factory = Arc::new(MockEndpointFactory::new(true));
        factory.script_outcomes(vec![Err("poison".into())]);

        let config = Arc::new(ActivationConfig {
            destination: "orders".to_string(),
            redelivery_attempts: 0,
            dead_letter_enabled: true,
            dead_letter_destination: Some("orders.dlq".to_string()),
            ..ActivationConfig::default()
        });
        let sender = Arc::new(DeadLetterSender::new(
            broker.connect().await,
            Destination::queue("orders.dlq"),
        ));
        let coordinator = DeliveryCoordinator::new(config, factory, Some(sender));

        let result = coordinator.deliver(&mut resource, test_message("m-8")).await;
        assert!(matches!(result, Err(AdapterError::Delivery { .. })));

        // Prepare failed before the send, and the branch was rolled back so
        // no prepared transaction is orphaned
        assert!(broker.sent_messages("orders.dlq").is_empty());
        let calls = xa.calls();
        assert!(matches!(calls.last(), Some(RecordedXaCall::Rollback { .. })));
    }

    #[tokio::test]
    async fn test_failed_handoff_commit_does_not_roll_back_with_redelivery() {
        let broker = MockBroker::new();
        let xa = Arc::new(RecordingXaResource::new(1));
        xa.fail_commit();
        let mut resource = transacted_resource(&broker, xa.clone()).await;

        let factory = Arc::new(MockEndpointFactory::new(true));
        factory.script_outcomes(vec![Err("a".into()), Err("b".into())]);

        let config = Arc::new(ActivationConfig {
            destination: "orders".to_string(),
            redelivery_attempts: 2,
            redelivery_interval_ms: 0,
            dead_letter_enabled: true,
            dead_letter_destination: Some("orders.dlq".to_string()),
            ..ActivationConfig::default()
        });
        let sender = Arc::new(DeadLetterSender::new(
            broker.connect().await,
            Destination::queue("orders.dlq"),
        ));
        let coordinator = DeliveryCoordinator::new(config, factory, Some(sender));

        let result = coordinator.deliver(&mut resource, test_message("m-9")).await;
        assert!(matches!(result, Err(AdapterError::Delivery { .. })));

        // The send itself happened before the commit failed
        assert_eq!(broker.sent_messages("orders.dlq").len(), 1);
        // On the redelivery path the failure is logged only: the deferred
        // branch is never rolled back on the container's behalf
        assert!(xa
            .calls()
            .iter()
            .all(|c| !matches!(c, RecordedXaCall::Rollback { .. })));
    }

    #[tokio::test]
    async fn test_retry_then_success_sends_nothing_to_dead_letter() {
        let broker = MockBroker::new();
        let xa = Arc::new(RecordingXaResource::new(1));
        let mut resource = transacted_resource(&broker, xa.clone()).await;

        let factory = Arc::new(MockEndpointFactory::new(true));
        factory.script_outcomes(vec![Err("transient".into()), Ok(())]);

        let config = Arc::new(ActivationConfig {
            destination: "orders".to_string(),
            redelivery_attempts: 2,
            redelivery_interval_ms: 0,
            dead_letter_enabled: true,
            dead_letter_destination: Some("orders.dlq".to_string()),
            ..ActivationConfig::default()
        });
        let sender = Arc::new(DeadLetterSender::new(
            broker.connect().await,
            Destination::queue("orders.dlq"),
        ));
        let coordinator = DeliveryCoordinator::new(config, factory.clone(), Some(sender));

        coordinator
            .deliver(&mut resource, test_message("m-4"))
            .await
            .unwrap();

        assert_eq!(factory.invocations().len(), 2);
        assert!(broker.sent_messages("orders.dlq").is_empty());
    }

    #[tokio::test]
    async fn test_non_transacted_failure_is_swallowed() {
        let broker = MockBroker::new();
        let connection = broker.connect().await;
        let session = connection.create_session(false).await.unwrap();
        let mut resource = DeliveryResource::new(0, session, None);

        let factory = Arc::new(MockEndpointFactory::new(false));
        factory.script_outcomes(vec![Err("boom".into())]);

        let coordinator = DeliveryCoordinator::new(test_config(0, 0), factory.clone(), None);
        // Swallowed after logging: the backend considers the message consumed
        coordinator
            .deliver(&mut resource, test_message("m-5"))
            .await
            .unwrap();
        assert_eq!(factory.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_non_transacted_dead_letter_without_branch() {
        let broker = MockBroker::new();
        let connection = broker.connect().await;
        let session = connection.create_session(false).await.unwrap();
        let mut resource = DeliveryResource::new(0, session, None);

        let factory = Arc::new(MockEndpointFactory::new(false));
        factory.script_outcomes(vec![Err("poison".into())]);

        let config = Arc::new(ActivationConfig {
            destination: "orders".to_string(),
            dead_letter_enabled: true,
            dead_letter_destination: Some("orders.dlq".to_string()),
            ..ActivationConfig::default()
        });
        let sender = Arc::new(DeadLetterSender::new(
            broker.connect().await,
            Destination::queue("orders.dlq"),
        ));
        let coordinator = DeliveryCoordinator::new(config, factory, Some(sender));

        coordinator
            .deliver(&mut resource, test_message("m-6"))
            .await
            .unwrap();
        assert_eq!(broker.sent_messages("orders.dlq").len(), 1);
    }

    #[tokio::test]
    async fn test_hold_until_ack_timeout_is_a_delivery_failure() {
        let broker = MockBroker::new();
        let connection = broker.connect().await;
        let session = connection.create_session(false).await.unwrap();
        let mut resource = DeliveryResource::new(0, session, None);

        let factory = Arc::new(MockEndpointFactory::new(true));
        factory.script_outcomes(vec![Ok(())]);
        factory.script_acks(vec![false]);

        let config = Arc::new(ActivationConfig {
            destination: "orders".to_string(),
            hold_until_ack: true,
            ack_timeout_ms: 10,
            ..ActivationConfig::default()
        });
        let coordinator = DeliveryCoordinator::new(config, factory, None);

        let result = coordinator.deliver(&mut resource, test_message("m-7")).await;
        assert!(matches!(result, Err(AdapterError::Delivery { .. })));
    }
}
