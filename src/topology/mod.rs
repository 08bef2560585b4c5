//! Broker topology declaration.
//!
//! Declares the pipeline's exchange, main queue, error queue and binding.
//! Declaration is idempotent; redeclaring an entity with different
//! parameters is a conflict that must be fixed by an operator, never coerced.

use std::sync::Arc;

use tracing::{error, info};

use crate::broker::{Broker, BrokerChannel, BrokerError, ExchangeSpec, QueueSpec};
use crate::config::{RabbitMqSettings, ERROR_QUEUE_SUFFIX};

/// Routing key binding the main queue to the fanout exchange.
pub const BINDING_KEY: &str = "";

/// Topology declaration errors.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// An entity already exists with incompatible parameters.
    #[error("Topology conflict on {entity}: {detail}")]
    Conflict { entity: String, detail: String },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Error queue name for a main queue.
pub fn error_queue_name(queue: &str) -> String {
    format!("{}{}", queue, ERROR_QUEUE_SUFFIX)
}

/// Main queue declaration, with dead-letter arguments when enabled.
pub fn main_queue_spec(queue: &str, dead_letter: bool) -> QueueSpec {
    let spec = QueueSpec::durable(queue);
    if dead_letter {
        spec.dead_letter_to_queue(error_queue_name(queue))
    } else {
        spec
    }
}

/// Declares exchanges, queues and bindings before publish/consume starts.
pub struct TopologyManager {
    broker: Arc<dyn Broker>,
    dead_letter: bool,
}

impl TopologyManager {
    /// Manager that wires the main queue's rejections to its error queue.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            dead_letter: true,
        }
    }

    pub fn from_settings(broker: Arc<dyn Broker>, settings: &RabbitMqSettings) -> Self {
        Self {
            broker,
            dead_letter: settings.dead_letter,
        }
    }

    /// Leave the main queue without dead-letter arguments.
    pub fn without_dead_letter(mut self) -> Self {
        self.dead_letter = false;
        self
    }

    /// Declare the fanout exchange, error queue, main queue and binding.
    ///
    /// Safe to call any number of times with the same arguments.
    pub async fn ensure_topology(&self, exchange: &str, queue: &str) -> Result<(), TopologyError> {
        let channel = self.broker.open_channel().await?;
        let result = self.declare(channel.as_ref(), exchange, queue).await;

        // A failed declare already closed the channel broker-side
        if result.is_ok() {
            channel.close().await?;
        }

        match &result {
            Ok(()) => info!(
                exchange = %exchange,
                queue = %queue,
                dead_letter = self.dead_letter,
                "Topology ensured"
            ),
            Err(e) => error!(
                exchange = %exchange,
                queue = %queue,
                error = %e,
                "Topology declaration failed"
            ),
        }
        result
    }

    async fn declare(
        &self,
        channel: &dyn BrokerChannel,
        exchange: &str,
        queue: &str,
    ) -> Result<(), TopologyError> {
        channel
            .exchange_declare(&ExchangeSpec::fanout(exchange))
            .await
            .map_err(|e| conflict(format!("exchange '{}'", exchange), e))?;

        if self.dead_letter {
            let error_queue = error_queue_name(queue);
            channel
                .queue_declare(&QueueSpec::durable(&error_queue))
                .await
                .map_err(|e| conflict(format!("queue '{}'", error_queue), e))?;
        }

        channel
            .queue_declare(&main_queue_spec(queue, self.dead_letter))
            .await
            .map_err(|e| conflict(format!("queue '{}'", queue), e))?;

        channel
            .queue_bind(queue, exchange, BINDING_KEY)
            .await
            .map_err(|e| conflict(format!("binding '{}' -> '{}'", exchange, queue), e))?;

        Ok(())
    }
}

fn conflict(entity: String, error: BrokerError) -> TopologyError {
    match error {
        BrokerError::PreconditionFailed(detail) => TopologyError::Conflict { entity, detail },
        other => TopologyError::Broker(other),
    }
}
