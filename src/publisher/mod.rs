//! Event publisher.
//!
//! Publishes envelopes as persistent messages to the fanout exchange with an
//! empty routing key. In `Confirmed` mode a publish returns only after the
//! broker confirmed it.
//!
//! The publisher owns one channel. Calls from several tasks are serialized
//! with a mutex around the publish. A channel lost to a broker failure is
//! dropped and reopened on the next call.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerChannel, BrokerError};
use crate::config::RabbitMqSettings;
use crate::envelope::{CodecError, EventEnvelope};

/// Routing key for fanout publication.
const FANOUT_ROUTING_KEY: &str = "";

/// Delivery guarantee a successful publish carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmMode {
    /// Success means the broker confirmed the message.
    #[default]
    Confirmed,
    /// Success means the local send returned without error.
    Fire,
}

/// Publish failures.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// No connection or channel to the broker.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker refused the message.
    #[error("Publish rejected: {0}")]
    Rejected(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Broker error: {0}")]
    Broker(BrokerError),
}

impl From<BrokerError> for PublishError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::Unavailable(msg) | BrokerError::ChannelClosed(msg) => {
                PublishError::BrokerUnavailable(msg)
            }
            BrokerError::Nacked(msg) | BrokerError::NotFound(msg) => PublishError::Rejected(msg),
            other => PublishError::Broker(other),
        }
    }
}

/// Publishes envelopes to one exchange.
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    exchange: String,
    confirm_mode: ConfirmMode,
    channel: Mutex<Option<Box<dyn BrokerChannel>>>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>, confirm_mode: ConfirmMode) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            confirm_mode,
            channel: Mutex::new(None),
        }
    }

    pub fn from_settings(broker: Arc<dyn Broker>, settings: &RabbitMqSettings) -> Self {
        Self::new(broker, settings.exchange.clone(), settings.confirm_mode)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn confirm_mode(&self) -> ConfirmMode {
        self.confirm_mode
    }

    /// Encode a typed event and publish it. Returns the assigned message id.
    pub async fn publish_event<T: Serialize>(
        &self,
        event_type: &str,
        event: &T,
    ) -> Result<Uuid, PublishError> {
        let envelope = EventEnvelope::encode(event_type, event)?;
        self.publish(&envelope).await?;
        Ok(envelope.message_id)
    }

    /// Publish an envelope as a persistent message.
    #[tracing::instrument(
        name = "publisher.publish",
        skip_all,
        fields(
            exchange = %self.exchange,
            event_type = %envelope.event_type,
            message_id = %envelope.message_id
        )
    )]
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        // Always delivery mode 2, whatever the envelope asked for
        let message = EventEnvelope {
            persistent: true,
            ..envelope.clone()
        }
        .to_message();
        let mut guard = self.channel.lock().await;

        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(channel) = guard.as_ref() else {
            return Err(PublishError::BrokerUnavailable("no publish channel".to_string()));
        };

        match channel
            .basic_publish(&self.exchange, FANOUT_ROUTING_KEY, false, &message)
            .await
        {
            Ok(()) => {
                debug!(confirm_mode = ?self.confirm_mode, "Published");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Publish failed");
                // Channel-level failures leave the channel unusable
                if !matches!(e, BrokerError::Nacked(_)) {
                    *guard = None;
                }
                Err(e.into())
            }
        }
    }

    /// Close the publish channel, if open.
    pub async fn close(&self) -> Result<(), PublishError> {
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await?;
        }
        Ok(())
    }

    async fn open(&self) -> Result<Box<dyn BrokerChannel>, PublishError> {
        let channel = self.broker.open_channel().await?;
        if self.confirm_mode == ConfirmMode::Confirmed {
            channel.confirm_select().await?;
        }
        debug!(exchange = %self.exchange, "Opened publish channel");
        Ok(channel)
    }
}
