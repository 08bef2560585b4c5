use super::*;
use crate::broker::InMemoryBroker;
use crate::publisher::ConfirmMode;
use crate::topology::TopologyManager;
use serde_json::json;

const EXCHANGE: &str = "notification-create";
const QUEUE: &str = "notification.service.queue";

async fn setup() -> (InMemoryBroker, Arc<InMemoryOutboxStore>, OutboxRelay) {
    let broker = InMemoryBroker::new();
    TopologyManager::new(Arc::new(broker.clone()))
        .ensure_topology(EXCHANGE, QUEUE)
        .await
        .unwrap();
    let publisher = Arc::new(EventPublisher::new(
        Arc::new(broker.clone()),
        EXCHANGE,
        ConfirmMode::Confirmed,
    ));
    let store = Arc::new(InMemoryOutboxStore::new());
    let relay = OutboxRelay::new(store.clone(), publisher).with_max_attempts(3);
    (broker, store, relay)
}

#[test]
fn test_record_from_event_serializes_payload() {
    let record = OutboxRecord::from_event("ProductCreated", &json!({"userId": "u1"})).unwrap();

    assert_eq!(record.event_type, "ProductCreated");
    assert_eq!(record.payload_json, r#"{"userId":"u1"}"#);
    assert!(record.is_pending());
    assert!(!record.is_flagged());
}

#[test]
fn test_envelope_reuses_record_id() {
    let record = OutboxRecord::new("ProductCreated", "{}");
    let first = record.to_envelope();
    let second = record.to_envelope();

    assert_eq!(first.message_id, record.id);
    assert_eq!(first.message_id, second.message_id);
    assert!(first.persistent);
}

#[tokio::test]
async fn test_relay_publishes_pending_oldest_first() {
    let (broker, store, relay) = setup().await;
    let mut older = OutboxRecord::new("ProductCreated", r#"{"n":1}"#);
    older.created_at = Utc::now() - chrono::Duration::seconds(5);
    let newer = OutboxRecord::new("ProductUpdated", r#"{"n":2}"#);
    store.stage(&newer).await.unwrap();
    store.stage(&older).await.unwrap();

    let report = relay.relay_pending().await.unwrap();

    assert_eq!(report, RelayReport { published: 2, failed: 0, flagged: 0 });
    let messages = broker.peek(QUEUE).await;
    let ids: Vec<_> = messages
        .iter()
        .map(|m| m.properties.message_id().as_ref().map(|id| id.as_str().to_string()))
        .collect();
    assert_eq!(ids, vec![Some(older.id.to_string()), Some(newer.id.to_string())]);
    assert!(store.pending(10).await.unwrap().is_empty());
    assert!(store.records().iter().all(|r| r.published_at.is_some()));
}

#[tokio::test]
async fn test_relay_with_nothing_pending_is_a_no_op() {
    let (broker, _store, relay) = setup().await;

    let report = relay.relay_pending().await.unwrap();

    assert_eq!(report, RelayReport::default());
    assert_eq!(broker.publish_count().await, 0);
}

#[tokio::test]
async fn test_broker_outage_keeps_records_pending() {
    let (broker, store, relay) = setup().await;
    store.stage(&OutboxRecord::new("A", "{}")).await.unwrap();
    store.stage(&OutboxRecord::new("B", "{}")).await.unwrap();
    broker.set_available(false).await;

    let report = relay.relay_pending().await.unwrap();

    // The pass stops at the first unavailable error
    assert_eq!(report.failed, 1);
    assert_eq!(report.published, 0);
    let records = store.records();
    assert!(records.iter().all(|r| r.attempts == 0 && r.last_error.is_none()));
    assert_eq!(store.pending(10).await.unwrap().len(), 2);

    broker.set_available(true).await;
    let report = relay.relay_pending().await.unwrap();

    assert_eq!(report.published, 2);
    assert_eq!(broker.queue_depth(QUEUE).await, Some(2));
}

#[tokio::test]
async fn test_long_outage_never_flags_records() {
    let (broker, store, relay) = setup().await;
    let record = OutboxRecord::new("ProductUpdated", r#"{"title":"Product updated"}"#);
    store.stage(&record).await.unwrap();
    broker.set_available(false).await;

    // More passes than max_attempts (3)
    for _ in 0..5 {
        let report = relay.relay_pending().await.unwrap();
        assert_eq!(report, RelayReport { published: 0, failed: 1, flagged: 0 });
    }

    let current = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(current.attempts, 0);
    assert!(current.is_pending());
    assert!(store.flagged().await.unwrap().is_empty());

    broker.set_available(true).await;
    let report = relay.relay_pending().await.unwrap();

    assert_eq!(report, RelayReport { published: 1, failed: 0, flagged: 0 });
    assert_eq!(broker.queue_depth(QUEUE).await, Some(1));
}

#[tokio::test]
async fn test_record_is_flagged_after_max_attempts_and_kept() {
    let broker = InMemoryBroker::new();
    // No topology: every publish is rejected by the broker
    let publisher = Arc::new(EventPublisher::new(
        Arc::new(broker.clone()),
        "missing-exchange",
        ConfirmMode::Confirmed,
    ));
    let store = Arc::new(InMemoryOutboxStore::new());
    let relay = OutboxRelay::new(store.clone(), publisher).with_max_attempts(2);
    let record = OutboxRecord::new("A", "{}");
    store.stage(&record).await.unwrap();

    let first = relay.relay_pending().await.unwrap();
    assert_eq!(first, RelayReport { published: 0, failed: 1, flagged: 0 });

    let second = relay.relay_pending().await.unwrap();
    assert_eq!(second, RelayReport { published: 0, failed: 1, flagged: 1 });

    // Flagged records are skipped but never deleted
    let third = relay.relay_pending().await.unwrap();
    assert_eq!(third, RelayReport::default());
    let flagged = store.flagged().await.unwrap();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].id, record.id);
    assert_eq!(flagged[0].attempts, 2);
    assert!(flagged[0].published_at.is_none());
}

#[tokio::test]
async fn test_stage_and_publish_tolerates_publish_failure() {
    let (broker, store, relay) = setup().await;
    broker.set_available(false).await;

    let record = OutboxRecord::new("A", "{}");
    let published = relay.stage_and_publish(&record).await.unwrap();

    assert!(!published);
    assert!(store.get(record.id).await.unwrap().unwrap().is_pending());

    broker.set_available(true).await;
    let record = OutboxRecord::new("B", "{}");
    assert!(relay.stage_and_publish(&record).await.unwrap());
    assert!(store.get(record.id).await.unwrap().unwrap().published_at.is_some());
}

#[tokio::test]
async fn test_duplicate_stage_is_rejected() {
    let store = InMemoryOutboxStore::new();
    let record = OutboxRecord::new("A", "{}");

    store.stage(&record).await.unwrap();

    assert!(matches!(
        store.stage(&record).await,
        Err(OutboxError::Storage(_))
    ));
}

#[tokio::test]
async fn test_spawned_relay_publishes_and_stops() {
    let (broker, store, relay) = setup().await;
    store.stage(&OutboxRecord::new("A", "{}")).await.unwrap();

    let handle = relay.with_interval(Duration::from_millis(10)).spawn();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while broker.queue_depth(QUEUE).await != Some(1) {
        assert!(tokio::time::Instant::now() < deadline, "relay never published");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tokio::time::timeout(Duration::from_secs(1), handle.stop())
        .await
        .unwrap();
    assert!(store.pending(10).await.unwrap().is_empty());
}
