// tests/transport_memory.rs

use std::sync::Arc;

use tokio::time::{timeout, Duration};

use peril::{
    // ---
    create_memory_transport_with_hub,
    declare_and_bind,
    ensure_game_topology,
    resolve,
    routing,
    AckVerdict,
    ContentType,
    Delivery,
    Durability,
    Envelope,
    MemoryHub,
    PerilConfig,
    PerilError,
    RoutingTarget,
    SubscriptionHandle,
    TransportPtr,
};

async fn connect(hub: &Arc<MemoryHub>, id: &str) -> TransportPtr {
    // ---
    let transport = create_memory_transport_with_hub(&PerilConfig::memory(id), hub.clone())
        .await
        .expect("failed to create memory transport");
    ensure_game_topology(transport.as_ref())
        .await
        .expect("game topology");
    transport
}

fn moves_queue(username: &str, durability: Durability) -> RoutingTarget {
    RoutingTarget::new(
        routing::EXCHANGE_PERIL_TOPIC,
        routing::dotted(routing::ARMY_MOVES_PREFIX, username),
        routing::any_player(routing::ARMY_MOVES_PREFIX),
        durability,
    )
}

async fn next(handle: &mut SubscriptionHandle) -> Delivery {
    timeout(Duration::from_millis(200), handle.inbox.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("inbox closed unexpectedly")
}

#[tokio::test]
async fn declare_and_bind_is_idempotent() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let transport = connect(&hub, "alice").await;
    let target = moves_queue("alice", Durability::Transient);

    // ---
    // Act
    // ---
    let first = declare_and_bind(transport.as_ref(), &target).await.expect("first declare");
    let second = declare_and_bind(transport.as_ref(), &target).await.expect("second declare");

    // ---
    // Assert
    // ---
    assert_eq!(first.name, "army_moves.alice");
    assert_eq!(first, second);
    assert!(hub.queue_exists("army_moves.alice"));
    assert_eq!(
        hub.bindings("army_moves.alice"),
        vec![("peril_topic".to_string(), "army_moves.*".to_string())]
    );
}

#[tokio::test]
async fn redeclaring_with_other_durability_is_refused() {
    // ---
    let hub = MemoryHub::new();
    let transport = connect(&hub, "alice").await;
    declare_and_bind(transport.as_ref(), &moves_queue("alice", Durability::Durable))
        .await
        .expect("declare durable");

    let err = declare_and_bind(transport.as_ref(), &moves_queue("alice", Durability::Transient))
        .await
        .expect_err("durability conflict");
    assert!(matches!(err, PerilError::Topology(_)));
}

#[tokio::test]
async fn topic_and_direct_routing() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let transport = connect(&hub, "alice").await;
    declare_and_bind(transport.as_ref(), &moves_queue("alice", Durability::Transient))
        .await
        .expect("moves queue");
    let pause = RoutingTarget::new(
        routing::EXCHANGE_PERIL_DIRECT,
        "pause.alice",
        routing::PAUSE_KEY,
        Durability::Transient,
    );
    declare_and_bind(transport.as_ref(), &pause).await.expect("pause queue");

    // ---
    // Act
    // ---
    for (exchange, key) in [
        ("peril_topic", "army_moves.bob"),
        ("peril_topic", "army_moves.bob.extra"),
        ("peril_topic", "war.bob"),
        ("peril_direct", "pause"),
        ("peril_direct", "pause.alice"),
    ] {
        transport
            .publish(exchange, key, Envelope::new(ContentType::Json, "{}"))
            .await
            .expect("publish");
    }

    // ---
    // Assert
    // ---
    let moves: Vec<String> = hub.peek("army_moves.alice").into_iter().map(|(k, _)| k).collect();
    assert_eq!(moves, vec!["army_moves.bob"]);
    let pauses: Vec<String> = hub.peek("pause.alice").into_iter().map(|(k, _)| k).collect();
    assert_eq!(pauses, vec!["pause"]);
}

#[tokio::test]
async fn ack_removes_the_message() {
    // ---
    let hub = MemoryHub::new();
    let transport = connect(&hub, "alice").await;
    declare_and_bind(transport.as_ref(), &moves_queue("alice", Durability::Transient))
        .await
        .expect("declare");
    let mut handle = transport.consume("army_moves.alice").await.expect("consume");

    transport
        .publish("peril_topic", "army_moves.bob", Envelope::new(ContentType::Json, "1"))
        .await
        .expect("publish");
    let delivery = next(&mut handle).await;
    resolve(AckVerdict::Ack, &delivery).await.expect("ack");

    assert_eq!(hub.queue_depth("army_moves.alice"), Some(0));
    assert_eq!(hub.unacked_count("army_moves.alice"), Some(0));
    assert!(hub.peek(routing::QUEUE_PERIL_DLQ).is_empty());
    assert!(handle.inbox.try_recv().is_err());
}

#[tokio::test]
async fn requeue_redelivers_an_equivalent_message() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let transport = connect(&hub, "alice").await;
    declare_and_bind(transport.as_ref(), &moves_queue("alice", Durability::Transient))
        .await
        .expect("declare");
    let mut handle = transport.consume("army_moves.alice").await.expect("consume");

    transport
        .publish("peril_topic", "army_moves.bob", Envelope::new(ContentType::Json, "payload"))
        .await
        .expect("publish");
    let first = next(&mut handle).await;
    assert!(!first.redelivered());

    // ---
    // Act
    // ---
    resolve(AckVerdict::RequeueRetry, &first).await.expect("requeue");

    // ---
    // Assert
    // ---
    let again = next(&mut handle).await;
    assert!(again.redelivered());
    assert_eq!(again.routing_key(), "army_moves.bob");
    assert_eq!(again.envelope(), first.envelope());
    assert!(hub.peek(routing::QUEUE_PERIL_DLQ).is_empty());
}

#[tokio::test]
async fn discard_routes_to_dead_letter_queue_only() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let transport = connect(&hub, "alice").await;
    declare_and_bind(transport.as_ref(), &moves_queue("alice", Durability::Transient))
        .await
        .expect("declare");
    let mut handle = transport.consume("army_moves.alice").await.expect("consume");

    transport
        .publish("peril_topic", "army_moves.bob", Envelope::new(ContentType::Json, "bad"))
        .await
        .expect("publish");
    let delivery = next(&mut handle).await;

    // ---
    // Act
    // ---
    resolve(AckVerdict::DiscardPermanently, &delivery).await.expect("discard");

    // ---
    // Assert
    // ---
    let dead = hub.peek(routing::QUEUE_PERIL_DLQ);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].0, "army_moves.bob");
    assert_eq!(dead[0].1.payload().as_ref(), b"bad");

    assert_eq!(hub.queue_depth("army_moves.alice"), Some(0));
    assert_eq!(hub.unacked_count("army_moves.alice"), Some(0));
    let nothing = timeout(Duration::from_millis(50), handle.inbox.recv()).await;
    assert!(nothing.is_err(), "discarded message came back");
}

#[tokio::test]
async fn second_consumer_of_a_queue_is_refused() {
    // ---
    let hub = MemoryHub::new();
    let transport = connect(&hub, "server").await;
    let target = RoutingTarget::new(
        routing::EXCHANGE_PERIL_TOPIC,
        "shared",
        "#",
        Durability::Durable,
    );
    declare_and_bind(transport.as_ref(), &target).await.expect("declare");

    let _first = transport.consume("shared").await.expect("first consumer");
    let err = transport.consume("shared").await.expect_err("second consumer");

    assert!(matches!(err, PerilError::AlreadyConsuming(ref q) if q == "shared"));
}

#[tokio::test]
async fn exclusive_queues_belong_to_one_connection() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let alice = connect(&hub, "alice").await;
    let mallory = connect(&hub, "mallory").await;
    let target = moves_queue("alice", Durability::Transient);
    declare_and_bind(alice.as_ref(), &target).await.expect("declare");

    // ---
    // Act / Assert
    // ---
    let err = declare_and_bind(mallory.as_ref(), &target)
        .await
        .expect_err("redeclare from other connection");
    assert!(matches!(err, PerilError::Topology(_)));

    let err = mallory
        .consume("army_moves.alice")
        .await
        .expect_err("consume from other connection");
    assert!(matches!(err, PerilError::Transport(_)));

    alice.close().await.expect("close");
    assert!(!hub.queue_exists("army_moves.alice"));

    // The durable dead-letter queue outlives every connection.
    assert!(hub.queue_exists(routing::QUEUE_PERIL_DLQ));
}

#[tokio::test]
async fn publish_to_unknown_exchange_fails() {
    // ---
    let hub = MemoryHub::new();
    let transport = connect(&hub, "alice").await;

    let err = transport
        .publish("nope", "k", Envelope::new(ContentType::Binary, vec![1u8, 2, 3]))
        .await
        .expect_err("unknown exchange");
    assert!(matches!(err, PerilError::Transport(_)));
}

#[tokio::test]
async fn close_revokes_deliveries_waiting_in_the_inbox() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let transport = connect(&hub, "worker").await;
    let target = RoutingTarget::new(routing::EXCHANGE_PERIL_TOPIC, "orders", "orders.*", Durability::Durable);
    declare_and_bind(transport.as_ref(), &target).await.expect("declare");
    let mut handle = transport.consume("orders").await.expect("consume");

    for n in 0..2u8 {
        transport
            .publish("peril_topic", "orders.bob", Envelope::new(ContentType::Binary, vec![n]))
            .await
            .expect("publish");
    }
    let first = next(&mut handle).await;
    assert!(!first.is_revoked());

    // ---
    // Act
    // ---
    transport.close().await.expect("close");

    // ---
    // Assert
    // ---
    assert!(first.is_revoked());
    let err = resolve(AckVerdict::Ack, &first).await.expect_err("ack after close");
    assert!(matches!(err, PerilError::ConnectionClosed));

    let second = next(&mut handle).await;
    assert!(second.is_revoked());
    let end = timeout(Duration::from_millis(200), handle.inbox.recv()).await;
    assert!(matches!(end, Ok(None)), "inbox stayed open after close");

    assert_eq!(hub.queue_depth("orders"), Some(2));
    assert_eq!(hub.unacked_count("orders"), Some(0));
}
