//! herald-relay: outbox relay
//!
//! Publishes outbox records staged by the producing service to the
//! notification exchange. Records are marked published only after the broker
//! confirmed them; records that keep failing are flagged and kept.
//!
//! ## Configuration
//! - `--config <path>` or HERALD_CONFIG: YAML config file
//! - HERALD__OUTBOX__DATABASE_URL: SQLite database holding the outbox table
//! - HERALD__OUTBOX__RELAY_INTERVAL_SECS, HERALD__OUTBOX__MAX_ATTEMPTS: relay tuning
//! - HERALD_LOG: tracing filter (default "info")

use std::sync::Arc;

use tracing::{error, info, warn};

use herald::broker::{AmqpBroker, Broker};
use herald::config::Config;
use herald::outbox::{OutboxRelay, OutboxStore, SqliteOutboxStore};
use herald::publisher::EventPublisher;
use herald::topology::TopologyManager;
use herald::utils::bootstrap::{
    connect_with_retry, init_tracing, parse_config_path, shutdown_signal,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let rabbitmq = &config.rabbitmq;

    if !config.outbox.enabled {
        warn!("Outbox relay is disabled (outbox.enabled = false)");
        return Ok(());
    }

    info!(
        exchange = %rabbitmq.exchange,
        database = %config.outbox.database_url,
        "Starting herald-relay"
    );

    let store: Arc<dyn OutboxStore> =
        Arc::new(SqliteOutboxStore::connect(&config.outbox.database_url).await?);

    let amqp = Arc::new(connect_with_retry("rabbitmq", || AmqpBroker::connect(rabbitmq)).await?);
    let broker: Arc<dyn Broker> = amqp.clone();

    TopologyManager::from_settings(broker.clone(), rabbitmq)
        .ensure_topology(&rabbitmq.exchange, &rabbitmq.queue_name)
        .await?;

    let publisher = Arc::new(EventPublisher::from_settings(broker, rabbitmq));
    let relay = OutboxRelay::from_config(store.clone(), publisher.clone(), &config.outbox);

    // Drain the backlog left by a previous run before waiting on the interval
    let report = relay.relay_pending().await?;
    info!(
        published = report.published,
        failed = report.failed,
        "Initial outbox backlog relayed"
    );

    let handle = relay.spawn();

    shutdown_signal().await;

    handle.stop().await;
    publisher.close().await?;

    let flagged = store.flagged().await?;
    if !flagged.is_empty() {
        warn!(count = flagged.len(), "Outbox records awaiting manual inspection");
    }

    amqp.close();
    info!("herald-relay stopped");
    Ok(())
}
