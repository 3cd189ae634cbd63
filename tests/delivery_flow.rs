//! End-to-end delivery through the consumer controller against the
//! in-memory broker.

use mq_bridge::config::ActivationConfig;
use mq_bridge::consumer::ConsumerController;
use mq_bridge::context::AdapterContext;
use mq_bridge::delivery::{PROP_DELIVERY_ATTEMPTS, PROP_ORIGINAL_DESTINATION};
use mq_bridge::test_support::{
    MockBroker, MockConnectionFactory, MockEndpointFactory, MockResolver,
};
use mq_bridge::{Destination, Message};
use std::sync::Arc;
use std::time::Duration;

fn adapter_context(
    broker: &Arc<MockBroker>,
    endpoint_factory: Arc<MockEndpointFactory>,
) -> AdapterContext {
    let connection_factory = Arc::new(MockConnectionFactory::new(Arc::clone(broker)));
    AdapterContext::new(endpoint_factory, Arc::new(MockResolver::new(connection_factory)))
}

fn activation(destination: &str) -> ActivationConfig {
    ActivationConfig {
        destination: destination.to_string(),
        pool_max_size: 2,
        max_wait_ms: 1_000,
        endpoint_probe_interval_ms: 10,
        ..ActivationConfig::default()
    }
}

fn order_message(n: u32) -> Message {
    Message::new(
        format!("m-{n}"),
        Destination::queue("orders"),
        serde_json::json!({"order_id": n}),
    )
}

/// Poll until the condition holds or the deadline passes
async fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_pull_mode_delivers_more_messages_than_pool_slots() {
    let broker = MockBroker::new();
    let endpoint_factory = Arc::new(MockEndpointFactory::new(false));
    let context = adapter_context(&broker, endpoint_factory.clone());

    for n in 0..10 {
        broker.enqueue("orders", order_message(n));
    }

    let controller = ConsumerController::new(activation("orders"), context);
    controller.start().await.unwrap();

    let drained = wait_until(Duration::from_secs(5), || {
        endpoint_factory.invocations().len() == 10
    })
    .await;
    controller.stop().await;

    assert!(drained, "expected 10 deliveries, got {}", endpoint_factory.invocations().len());
    assert_eq!(broker.pending_count("orders"), 0);

    // Every enqueued message arrived exactly once
    let mut ids: Vec<String> = endpoint_factory
        .invocations()
        .into_iter()
        .map(|i| i.message_id)
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn test_failed_message_lands_on_dead_letter_destination() {
    let broker = MockBroker::new();
    let endpoint_factory = Arc::new(MockEndpointFactory::new(false));
    endpoint_factory.script_outcomes(vec![Err("cannot process".to_string())]);
    let context = adapter_context(&broker, endpoint_factory.clone());

    broker.enqueue("orders", order_message(1));

    let config = ActivationConfig {
        dead_letter_enabled: true,
        dead_letter_destination: Some("orders.dlq".to_string()),
        ..activation("orders")
    };
    let controller = ConsumerController::new(config, context);
    controller.start().await.unwrap();

    let routed = wait_until(Duration::from_secs(5), || {
        broker.sent_messages("orders.dlq").len() == 1
    })
    .await;
    controller.stop().await;

    assert!(routed, "message never reached the dead-letter destination");
    let dead = &broker.sent_messages("orders.dlq")[0];
    assert_eq!(
        dead.properties.get(PROP_ORIGINAL_DESTINATION).map(String::as_str),
        Some("orders")
    );
    assert_eq!(
        dead.properties.get(PROP_DELIVERY_ATTEMPTS).map(String::as_str),
        Some("1")
    );
}

#[tokio::test]
async fn test_load_balanced_instance_registers_partition_selector() {
    let broker = MockBroker::new();
    let endpoint_factory = Arc::new(MockEndpointFactory::new(false));
    let context = adapter_context(&broker, endpoint_factory);

    let config = ActivationConfig {
        instance_count: 3,
        instance_index: 1,
        ..activation("orders")
    };
    let controller = ConsumerController::new(config, context);
    controller.start().await.unwrap();

    // Receiver tasks create their consumers lazily through the pool
    let registered = wait_until(Duration::from_secs(5), || {
        !broker.consumer_selectors("orders").is_empty()
    })
    .await;
    controller.stop().await;

    assert!(registered, "no consumer was ever created");
    for selector in broker.consumer_selectors("orders") {
        assert_eq!(
            selector.as_deref(),
            Some("(timestamp - (timestamp / 3) * 3) = 1")
        );
    }
}

#[tokio::test]
async fn test_push_mode_drains_batches() {
    let broker = MockBroker::new();
    let endpoint_factory = Arc::new(MockEndpointFactory::new(false));
    let context = adapter_context(&broker, endpoint_factory.clone());

    for n in 0..6 {
        broker.enqueue("orders", order_message(n));
    }

    let config = ActivationConfig {
        consumer_mode: mq_bridge::ConsumerMode::Push,
        batch_size: 3,
        ..activation("orders")
    };
    let controller = ConsumerController::new(config, context);
    controller.start().await.unwrap();

    let drained = wait_until(Duration::from_secs(5), || {
        endpoint_factory.invocations().len() == 6
    })
    .await;
    controller.stop().await;

    assert!(drained, "expected 6 deliveries, got {}", endpoint_factory.invocations().len());
}

#[tokio::test]
async fn test_stop_is_idempotent_and_start_restarts_delivery() {
    let broker = MockBroker::new();
    let endpoint_factory = Arc::new(MockEndpointFactory::new(false));
    let context = adapter_context(&broker, endpoint_factory.clone());

    let controller = ConsumerController::new(activation("orders"), context);
    controller.start().await.unwrap();
    assert!(controller.is_running().await);

    controller.stop().await;
    controller.stop().await;
    assert!(!controller.is_running().await);

    // A fresh start picks up newly arriving messages
    controller.start().await.unwrap();
    broker.enqueue("orders", order_message(42));
    let delivered = wait_until(Duration::from_secs(5), || {
        !endpoint_factory.invocations().is_empty()
    })
    .await;
    controller.stop().await;
    assert!(delivered);
}
