use super::*;
use lapin::BasicProperties;
use std::time::Duration;

fn message(id: &str, body: &str) -> Message {
    Message {
        properties: BasicProperties::default().with_message_id(id.into()),
        body: body.as_bytes().to_vec(),
    }
}

async fn declare_pair(channel: &dyn BrokerChannel) {
    channel
        .exchange_declare(&ExchangeSpec::fanout("orders"))
        .await
        .unwrap();
    channel
        .queue_declare(&QueueSpec::durable("orders.queue_error"))
        .await
        .unwrap();
    channel
        .queue_declare(&QueueSpec::durable("orders.queue").dead_letter_to_queue("orders.queue_error"))
        .await
        .unwrap();
    channel.queue_bind("orders.queue", "orders", "").await.unwrap();
}

#[tokio::test]
async fn test_fanout_routes_to_every_bound_queue() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();
    channel
        .exchange_declare(&ExchangeSpec::fanout("orders"))
        .await
        .unwrap();
    for queue in ["a", "b"] {
        channel.queue_declare(&QueueSpec::durable(queue)).await.unwrap();
        channel.queue_bind(queue, "orders", "").await.unwrap();
    }

    channel
        .basic_publish("orders", "ignored", false, &message("m1", "{}"))
        .await
        .unwrap();

    assert_eq!(broker.queue_depth("a").await, Some(1));
    assert_eq!(broker.queue_depth("b").await, Some(1));
}

#[tokio::test]
async fn test_redeclare_same_spec_is_idempotent() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();
    declare_pair(channel.as_ref()).await;
    declare_pair(channel.as_ref()).await;

    assert_eq!(broker.exchange_count().await, 1);
    assert_eq!(broker.queue_count().await, 2);
    assert_eq!(broker.bindings("orders").await.len(), 1);
}

#[tokio::test]
async fn test_redeclare_with_different_args_fails_and_closes_channel() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();
    channel.queue_declare(&QueueSpec::durable("orders")).await.unwrap();

    let mut transient = QueueSpec::durable("orders");
    transient.durable = false;
    let err = channel.queue_declare(&transient).await.unwrap_err();
    assert!(matches!(err, BrokerError::PreconditionFailed(_)));

    let err = channel.basic_qos(1).await.unwrap_err();
    assert!(matches!(err, BrokerError::ChannelClosed(_)));
}

#[tokio::test]
async fn test_passive_declare_missing_queue_is_not_found() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();

    let err = channel.queue_declare_passive("missing").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
    assert_eq!(broker.channel_count().await, 0);
}

#[tokio::test]
async fn test_mandatory_publish_to_missing_queue_fails() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();

    // Without confirms the return is lost
    channel
        .basic_publish(DEFAULT_EXCHANGE, "nowhere", true, &message("m0", "{}"))
        .await
        .unwrap();

    channel.confirm_select().await.unwrap();
    let err = channel
        .basic_publish(DEFAULT_EXCHANGE, "nowhere", true, &message("m1", "{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));

    // Non-mandatory publishes are silently dropped
    channel
        .basic_publish(DEFAULT_EXCHANGE, "nowhere", false, &message("m2", "{}"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_nack_without_requeue_dead_letters() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();
    declare_pair(channel.as_ref()).await;
    channel
        .basic_publish("orders", "", false, &message("m1", r#"{"a":1}"#))
        .await
        .unwrap();

    let delivery = channel.basic_get("orders.queue").await.unwrap().unwrap();
    channel.basic_nack(delivery.delivery_tag, false).await.unwrap();

    assert_eq!(broker.queue_depth("orders.queue").await, Some(0));
    let dead = broker.peek("orders.queue_error").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, br#"{"a":1}"#.to_vec());
    let headers = dead[0].properties.headers().clone().unwrap();
    assert_eq!(
        headers.inner().get(FIRST_DEATH_QUEUE_HEADER),
        Some(&AMQPValue::LongString("orders.queue".into()))
    );
}

#[tokio::test]
async fn test_nack_with_requeue_returns_to_front() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();
    declare_pair(channel.as_ref()).await;
    for id in ["m1", "m2"] {
        channel
            .basic_publish("orders", "", false, &message(id, "{}"))
            .await
            .unwrap();
    }

    let first = channel.basic_get("orders.queue").await.unwrap().unwrap();
    assert!(!first.redelivered);
    channel.basic_nack(first.delivery_tag, true).await.unwrap();

    let again = channel.basic_get("orders.queue").await.unwrap().unwrap();
    assert!(again.redelivered);
    assert_eq!(
        again.message.properties.message_id().as_ref().map(|s| s.as_str()),
        Some("m1")
    );
}

#[tokio::test]
async fn test_double_ack_is_rejected() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();
    declare_pair(channel.as_ref()).await;
    channel
        .basic_publish("orders", "", false, &message("m1", "{}"))
        .await
        .unwrap();

    let delivery = channel.basic_get("orders.queue").await.unwrap().unwrap();
    channel.basic_ack(delivery.delivery_tag).await.unwrap();
    let err = channel.basic_ack(delivery.delivery_tag).await.unwrap_err();

    assert!(matches!(err, BrokerError::UnknownDeliveryTag(_)));
    assert_eq!(broker.invalid_settlements().await, 1);
    assert_eq!(broker.ack_log().await.len(), 1);
}

#[tokio::test]
async fn test_delivery_tags_are_per_channel() {
    let broker = InMemoryBroker::new();
    let setup = broker.open_channel().await.unwrap();
    declare_pair(setup.as_ref()).await;
    setup
        .basic_publish("orders", "", false, &message("m1", "{}"))
        .await
        .unwrap();

    let reader = broker.open_channel().await.unwrap();
    let delivery = reader.basic_get("orders.queue").await.unwrap().unwrap();

    let err = setup.basic_ack(delivery.delivery_tag).await.unwrap_err();
    assert!(matches!(err, BrokerError::UnknownDeliveryTag(_)));
}

#[tokio::test]
async fn test_close_requeues_unacked() {
    let broker = InMemoryBroker::new();
    let setup = broker.open_channel().await.unwrap();
    declare_pair(setup.as_ref()).await;
    setup
        .basic_publish("orders", "", false, &message("m1", "{}"))
        .await
        .unwrap();

    let reader = broker.open_channel().await.unwrap();
    let _delivery = reader.basic_get("orders.queue").await.unwrap().unwrap();
    assert_eq!(broker.unacked_count("orders.queue").await, 1);

    reader.close().await.unwrap();

    assert_eq!(broker.unacked_count("orders.queue").await, 0);
    assert_eq!(broker.queue_depth("orders.queue").await, Some(1));
}

#[tokio::test]
async fn test_consume_respects_prefetch() {
    let broker = InMemoryBroker::new();
    let setup = broker.open_channel().await.unwrap();
    declare_pair(setup.as_ref()).await;
    for id in ["m1", "m2"] {
        setup
            .basic_publish("orders", "", false, &message(id, "{}"))
            .await
            .unwrap();
    }

    let consumer = broker.open_channel().await.unwrap();
    consumer.basic_qos(1).await.unwrap();
    let mut stream = consumer.basic_consume("orders.queue", "c1").await.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(blocked.is_err(), "second delivery must wait for the ack");

    consumer.basic_ack(first.delivery_tag).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_ne!(first.delivery_tag, second.delivery_tag);
}

#[tokio::test]
async fn test_consume_wakes_on_publish() {
    let broker = InMemoryBroker::new();
    let setup = broker.open_channel().await.unwrap();
    declare_pair(setup.as_ref()).await;

    let consumer = broker.open_channel().await.unwrap();
    let mut stream = consumer.basic_consume("orders.queue", "c1").await.unwrap();

    let waiter = tokio::spawn(async move { stream.next().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    setup
        .basic_publish("orders", "", false, &message("m1", "{}"))
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.delivery_tag, 1);
}

#[tokio::test]
async fn test_cancel_ends_stream() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();
    declare_pair(channel.as_ref()).await;

    let mut stream = channel.basic_consume("orders.queue", "c1").await.unwrap();
    channel.basic_cancel("c1").await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_unavailable_broker_refuses_channels() {
    let broker = InMemoryBroker::new();
    broker.set_available(false).await;

    let err = broker.open_channel().await.err().unwrap();
    assert!(err.is_transient());

    broker.set_available(true).await;
    assert!(broker.open_channel().await.is_ok());
}
