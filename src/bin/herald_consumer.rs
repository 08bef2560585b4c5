//! herald-consumer: notification consumer
//!
//! Declares the notification topology, consumes `CreateNotificationEvent`
//! deliveries from the main queue and runs the dead-letter sweeper that moves
//! failed deliveries back for another attempt.
//!
//! ## Architecture
//! ```text
//! [notification-create exchange] -> [notification.service.queue] -> [consumer loop]
//!                                                |  nack
//!                                                v
//!                                   [notification.service.queue_error]
//!                                                |  sweeper
//!                                                v
//!                                   [notification.service.queue]
//! ```
//!
//! ## Configuration
//! - `--config <path>` or HERALD_CONFIG: YAML config file
//! - HERALD__RABBITMQ__HOST, HERALD__RABBITMQ__QUEUE_NAME, ...: overrides
//! - HERALD_LOG: tracing filter (default "info")

use std::sync::Arc;

use tracing::{error, info};

use herald::broker::{AmqpBroker, Broker};
use herald::config::Config;
use herald::consumer::{ConsumerLoop, ConsumerOptions, ConsumerRegistration};
use herald::dlq::DeadLetterSweeper;
use herald::events::{CreateNotificationEvent, CREATE_NOTIFICATION_EVENT};
use herald::handler::{
    HandlerContext, HandlerError, HandlerRegistry, IdempotentHandler,
    InMemoryProcessedMessageStore, TypedHandler,
};
use herald::topology::TopologyManager;
use herald::utils::bootstrap::{
    connect_with_retry, init_tracing, parse_config_path, shutdown_signal,
};

async fn handle_notification(
    event: CreateNotificationEvent,
    ctx: HandlerContext,
) -> Result<(), HandlerError> {
    info!(
        message_id = %ctx.message_id(),
        user_id = %event.user_id,
        product_id = ?event.product_id,
        title = %event.title,
        redelivered = ctx.redelivered(),
        "Notification received"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let rabbitmq = &config.rabbitmq;

    info!(
        exchange = %rabbitmq.exchange,
        queue = %rabbitmq.queue_name,
        "Starting herald-consumer"
    );

    let amqp = Arc::new(connect_with_retry("rabbitmq", || AmqpBroker::connect(rabbitmq)).await?);
    let broker: Arc<dyn Broker> = amqp.clone();

    TopologyManager::from_settings(broker.clone(), rabbitmq)
        .ensure_topology(&rabbitmq.exchange, &rabbitmq.queue_name)
        .await?;

    let handler =
        TypedHandler::<CreateNotificationEvent, _>::new("notification-handler", handle_notification);
    let mut registry = HandlerRegistry::new();
    registry.register(
        CREATE_NOTIFICATION_EVENT,
        Arc::new(IdempotentHandler::new(
            Arc::new(handler),
            Arc::new(InMemoryProcessedMessageStore::new()),
        )),
    )?;

    let consumer = ConsumerLoop::new(broker.clone(), Arc::new(registry))
        .with_options(ConsumerOptions::from_config(rabbitmq, &config.consumer));
    let consumer = consumer
        .start(ConsumerRegistration::new(
            CREATE_NOTIFICATION_EVENT,
            rabbitmq.queue_name.clone(),
            rabbitmq.exchange.clone(),
        ))
        .await?;

    let sweeper = if config.sweeper.enabled && rabbitmq.dead_letter {
        Some(DeadLetterSweeper::from_config(broker.clone(), rabbitmq, &config.sweeper).spawn())
    } else {
        info!("Dead-letter sweeper disabled");
        None
    };

    shutdown_signal().await;

    if let Some(sweeper) = sweeper {
        sweeper.stop().await;
    }
    let stats = consumer.stop().await?;
    info!(
        acked = stats.acked(),
        nacked = stats.nacked(),
        discarded = stats.discarded(),
        "herald-consumer stopped"
    );

    amqp.close();
    Ok(())
}
