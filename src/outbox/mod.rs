//! Transactional outbox.
//!
//! The producing service stages an `OutboxRecord` in the same database
//! transaction as the business change that caused it. The relay later hands
//! unpublished records to the `EventPublisher`:
//!
//! 1. Read unpublished, unflagged records oldest first
//! 2. Publish each one; the record id becomes the message id
//! 3. Set `published_at` once the broker confirmed
//! 4. On failure, count the attempt; at `max_attempts` flag the record
//!    (`failed_at`, `last_error`) for manual inspection
//!
//! Records are never deleted by the relay, so an event either ends up
//! published or flagged.
//!
//! # Configuration
//!
//! ```yaml
//! outbox:
//!   enabled: true
//!   database_url: sqlite://herald-outbox.db
//!   relay_interval_secs: 5
//!   batch_size: 100
//!   max_attempts: 10
//! ```

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryOutboxStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOutboxStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::envelope::{CodecError, EventEnvelope};
use crate::publisher::{EventPublisher, PublishError};

/// Outbox errors.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Outbox storage error: {0}")]
    Storage(String),

    #[error("Outbox record {0} not found")]
    NotFound(Uuid),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for OutboxError {
    fn from(error: sqlx::Error) -> Self {
        OutboxError::Storage(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OutboxError>;

/// One staged event.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub event_type: String,
    pub payload_json: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Set once `max_attempts` failed; the relay skips flagged records.
    pub failed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn new(event_type: impl Into<String>, payload_json: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload_json: payload_json.into(),
            created_at: Utc::now(),
            published_at: None,
            attempts: 0,
            last_error: None,
            failed_at: None,
        }
    }

    /// Serialize a typed event into a record.
    pub fn from_event<T: Serialize>(event_type: impl Into<String>, event: &T) -> Result<Self> {
        let payload = serde_json::to_string(event).map_err(CodecError::Serialize)?;
        Ok(Self::new(event_type, payload))
    }

    pub fn is_pending(&self) -> bool {
        self.published_at.is_none() && self.failed_at.is_none()
    }

    pub fn is_flagged(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Envelope carrying the record id as message id, so resends deduplicate.
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope::new(self.event_type.clone(), self.payload_json.clone().into_bytes())
            .with_message_id(self.id)
    }
}

/// Result of recording a failed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The record stays pending for another attempt.
    Retry { attempts: u32 },
    /// The record reached `max_attempts` and was flagged.
    Flagged { attempts: u32 },
}

/// Durable storage for outbox records.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Store a record outside any caller transaction.
    async fn stage(&self, record: &OutboxRecord) -> Result<()>;

    /// Unpublished, unflagged records, oldest first.
    async fn pending(&self, limit: u32) -> Result<Vec<OutboxRecord>>;

    async fn mark_published(&self, id: Uuid, published_at: DateTime<Utc>) -> Result<()>;

    /// Count a failed attempt; flag the record once `max_attempts` is reached.
    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<FailureDisposition>;

    /// Records flagged for manual inspection.
    async fn flagged(&self) -> Result<Vec<OutboxRecord>>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>>;
}

/// Counts for one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
    pub flagged: usize,
}

/// Hands staged records to the publisher.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<EventPublisher>,
    batch_size: u32,
    max_attempts: u32,
    interval: Duration,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<EventPublisher>) -> Self {
        let config = OutboxConfig::default();
        Self {
            store,
            publisher,
            batch_size: config.batch_size,
            max_attempts: config.max_attempts,
            interval: config.relay_interval(),
        }
    }

    pub fn from_config(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<EventPublisher>,
        config: &OutboxConfig,
    ) -> Self {
        Self {
            batch_size: config.batch_size,
            max_attempts: config.max_attempts,
            interval: config.relay_interval(),
            ..Self::new(store, publisher)
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stage a record and try to publish it right away.
    ///
    /// A failed publish is not an error: the record stays pending and the
    /// next relay pass resends it.
    pub async fn stage_and_publish(&self, record: &OutboxRecord) -> Result<bool> {
        self.store.stage(record).await?;
        match self.publish_record(record).await {
            Ok(()) => Ok(true),
            Err(OutboxError::Publish(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Publish one already staged record and mark it.
    ///
    /// Rejections and codec failures count as attempts. An unavailable broker
    /// does not.
    pub async fn publish_record(&self, record: &OutboxRecord) -> Result<()> {
        match self.publisher.publish(&record.to_envelope()).await {
            Ok(()) => {
                self.store.mark_published(record.id, Utc::now()).await?;
                debug!(id = %record.id, event_type = %record.event_type, "Outbox record published");
                Ok(())
            }
            Err(e @ PublishError::BrokerUnavailable(_)) => {
                // An outage says nothing about the record; attempts stay untouched
                warn!(id = %record.id, error = %e, "Broker unavailable, outbox record left pending");
                Err(e.into())
            }
            Err(e) => {
                let disposition = self
                    .store
                    .record_failure(record.id, &e.to_string(), self.max_attempts)
                    .await?;
                match disposition {
                    FailureDisposition::Retry { attempts } => warn!(
                        id = %record.id,
                        attempts,
                        error = %e,
                        "Outbox publish failed, will retry"
                    ),
                    FailureDisposition::Flagged { attempts } => error!(
                        id = %record.id,
                        attempts,
                        error = %e,
                        "Outbox record flagged for manual inspection"
                    ),
                }
                Err(e.into())
            }
        }
    }

    /// Publish every pending record, oldest first.
    ///
    /// Stops early when the broker is unavailable; the rest waits for the
    /// next pass.
    pub async fn relay_pending(&self) -> Result<RelayReport> {
        let records = self.store.pending(self.batch_size).await?;
        let mut report = RelayReport::default();

        for record in records {
            match self.publish_record(&record).await {
                Ok(()) => report.published += 1,
                Err(OutboxError::Publish(e)) => {
                    report.failed += 1;
                    if let Some(current) = self.store.get(record.id).await? {
                        if current.is_flagged() {
                            report.flagged += 1;
                        }
                    }
                    if matches!(e, PublishError::BrokerUnavailable(_)) {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if report.published > 0 || report.failed > 0 {
            info!(
                published = report.published,
                failed = report.failed,
                flagged = report.flagged,
                "Outbox relay pass complete"
            );
        }
        Ok(report)
    }

    /// Spawn a background task that relays pending records on an interval.
    ///
    /// Returns a handle that can be used to stop the task.
    pub fn spawn(self) -> RelayTaskHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(
                interval_ms = %self.interval.as_millis(),
                "Outbox relay task started"
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {
                        if let Err(e) = self.relay_pending().await {
                            error!(error = %e, "Outbox relay failed");
                        }
                    }
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            info!("Outbox relay task stopped");
                            break;
                        }
                    }
                }
            }
        });

        RelayTaskHandle {
            cancel: cancel_tx,
            task,
        }
    }
}

/// Handle to a running relay task.
pub struct RelayTaskHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayTaskHandle {
    /// Signal the relay task to stop and wait for it. A pass in progress finishes first.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Outbox relay task failed");
        }
    }
}

#[cfg(test)]
mod tests;
