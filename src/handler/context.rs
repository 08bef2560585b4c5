//! Per-delivery execution context.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::Extensions;
use uuid::Uuid;

/// Facts about the delivery a handler is processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub event_type: String,
    pub message_id: Uuid,
    pub correlation_id: Option<Uuid>,
}

/// Context handed to exactly one handler invocation.
///
/// Built fresh for every delivery by a [`ContextFactory`] and dropped once
/// the delivery is settled. Scoped resources (a database session, a
/// per-message cache) go into the typed extension map.
#[derive(Debug)]
pub struct HandlerContext {
    info: DeliveryInfo,
    received_at: DateTime<Utc>,
    extensions: Extensions,
}

impl HandlerContext {
    pub fn new(info: DeliveryInfo) -> Self {
        Self {
            info,
            received_at: Utc::now(),
            extensions: Extensions::new(),
        }
    }

    pub fn delivery(&self) -> &DeliveryInfo {
        &self.info
    }

    pub fn message_id(&self) -> Uuid {
        self.info.message_id
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.info.correlation_id
    }

    pub fn event_type(&self) -> &str {
        &self.info.event_type
    }

    pub fn redelivered(&self) -> bool {
        self.info.redelivered
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Typed lookup in the extension map.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    pub fn with_extension<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }
}

/// Builds a fresh context for each delivery.
pub type ContextFactory = Arc<dyn Fn(DeliveryInfo) -> HandlerContext + Send + Sync>;

/// Factory producing a bare context with an empty extension map.
pub fn default_context_factory() -> ContextFactory {
    Arc::new(HandlerContext::new)
}
