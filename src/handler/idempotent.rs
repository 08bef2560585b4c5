//! Duplicate suppression for at-least-once delivery.
//!
//! `IdempotentHandler` wraps any handler and consults a
//! `ProcessedMessageStore` keyed by (message id, handler name):
//!
//! 1. Already processed: skip and return `Ok`, so the delivery is acked.
//! 2. Otherwise delegate to the inner handler.
//! 3. Mark processed only after the inner handler succeeded.
//!
//! A failed inner handler is never marked, so the redelivery from the error
//! queue runs it again. Envelopes whose message id was generated on receipt
//! bypass the store entirely.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{EventHandler, HandlerContext, HandlerError};
use crate::envelope::EventEnvelope;

/// Records which handler already processed which message.
#[async_trait]
pub trait ProcessedMessageStore: Send + Sync {
    async fn contains(&self, message_id: Uuid, handler_name: &str) -> Result<bool, HandlerError>;

    async fn mark_processed(&self, message_id: Uuid, handler_name: &str) -> Result<(), HandlerError>;
}

/// Process-local store. Forgets everything on restart.
#[derive(Default)]
pub struct InMemoryProcessedMessageStore {
    processed: RwLock<HashSet<(Uuid, String)>>,
}

impl InMemoryProcessedMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.processed.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.processed.read().await.is_empty()
    }
}

#[async_trait]
impl ProcessedMessageStore for InMemoryProcessedMessageStore {
    async fn contains(&self, message_id: Uuid, handler_name: &str) -> Result<bool, HandlerError> {
        Ok(self
            .processed
            .read()
            .await
            .contains(&(message_id, handler_name.to_string())))
    }

    async fn mark_processed(&self, message_id: Uuid, handler_name: &str) -> Result<(), HandlerError> {
        self.processed
            .write()
            .await
            .insert((message_id, handler_name.to_string()));
        Ok(())
    }
}

/// Handler decorator that skips messages it has already processed.
pub struct IdempotentHandler {
    inner: Arc<dyn EventHandler>,
    processed: Arc<dyn ProcessedMessageStore>,
}

impl IdempotentHandler {
    pub fn new(inner: Arc<dyn EventHandler>, processed: Arc<dyn ProcessedMessageStore>) -> Self {
        Self { inner, processed }
    }
}

#[async_trait]
impl EventHandler for IdempotentHandler {
    async fn handle(&self, envelope: &EventEnvelope, ctx: HandlerContext) -> Result<(), HandlerError> {
        let handler_name = self.inner.name();

        if envelope.generated_message_id {
            debug!(
                message_id = %envelope.message_id,
                handler = %handler_name,
                "No producer message id, deduplication skipped"
            );
            return self.inner.handle(envelope, ctx).await;
        }

        if self.processed.contains(envelope.message_id, handler_name).await? {
            debug!(
                message_id = %envelope.message_id,
                handler = %handler_name,
                "Skipping duplicate message"
            );
            return Ok(());
        }

        self.inner.handle(envelope, ctx).await?;

        self.processed
            .mark_processed(envelope.message_id, handler_name)
            .await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
