//! Handler registry.
//!
//! Maps an event type to the business callback that processes it. Typed
//! payload decoding lives in the registry entry, so the consumer loop only
//! deals with envelopes.

mod context;
mod idempotent;

pub use context::{default_context_factory, ContextFactory, DeliveryInfo, HandlerContext};
pub use idempotent::{IdempotentHandler, InMemoryProcessedMessageStore, ProcessedMessageStore};

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::envelope::{CodecError, EventEnvelope};

/// Handler failures.
///
/// `Decode` means the payload can never be processed and the delivery is
/// discarded. Every other variant routes the delivery to the error queue.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Payload decode failed: {0}")]
    Decode(#[from] CodecError),

    #[error("Handler failed: {0}")]
    Failed(String),

    /// A service the handler depends on failed.
    #[error("Downstream failure: {0}")]
    Downstream(String),

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }

    pub fn downstream(msg: impl Into<String>) -> Self {
        HandlerError::Downstream(msg.into())
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Decode(_))
    }
}

/// Registry dispatch failures.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No handler registered for event type '{0}'")]
    NoHandler(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Event type '{0}' already has a handler")]
    Duplicate(String),
}

/// Business callback for one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one delivery. The context is owned by this invocation.
    async fn handle(&self, envelope: &EventEnvelope, ctx: HandlerContext) -> Result<(), HandlerError>;

    /// Stable name, used as the idempotency key and in logs.
    fn name(&self) -> &str;
}

/// Adapts an async function over a typed payload into an `EventHandler`.
pub struct TypedHandler<T, F> {
    name: String,
    f: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> TypedHandler<T, F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> EventHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, envelope: &EventEnvelope, ctx: HandlerContext) -> Result<(), HandlerError> {
        let event: T = envelope.decode_payload()?;
        (self.f)(event, ctx).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Event type to handler map.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. One handler per event type.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), RegistryError> {
        let event_type = event_type.into();
        if self.handlers.contains_key(&event_type) {
            return Err(RegistryError::Duplicate(event_type));
        }
        self.handlers.insert(event_type, handler);
        Ok(())
    }

    /// Register an async function over the decoded payload type.
    pub fn register_typed<T, F, Fut>(
        &mut self,
        event_type: impl Into<String>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let event_type = event_type.into();
        let handler = TypedHandler::<T, F>::new(event_type.clone(), f);
        self.register(event_type, Arc::new(handler))
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route an envelope to its handler.
    pub async fn dispatch(
        &self,
        envelope: &EventEnvelope,
        ctx: HandlerContext,
    ) -> Result<(), DispatchError> {
        let handler = self
            .get(&envelope.event_type)
            .ok_or_else(|| DispatchError::NoHandler(envelope.event_type.clone()))?;
        handler.handle(envelope, ctx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Created {
        title: String,
        user_id: Uuid,
    }

    fn ctx_for(envelope: &EventEnvelope) -> HandlerContext {
        HandlerContext::new(DeliveryInfo {
            queue: "orders.queue".into(),
            delivery_tag: 1,
            redelivered: false,
            event_type: envelope.event_type.clone(),
            message_id: envelope.message_id,
            correlation_id: None,
        })
    }

    #[tokio::test]
    async fn test_typed_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut registry = HandlerRegistry::new();
        registry
            .register_typed("ProductCreated", move |event: Created, _ctx| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().await.push((event.title, event.user_id));
                    Ok(())
                }
            })
            .unwrap();

        let envelope = EventEnvelope::new(
            "ProductCreated",
            r#"{"title":"Desk","userId":"11111111-1111-1111-1111-111111111111"}"#,
        );
        registry.dispatch(&envelope, ctx_for(&envelope)).await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "Desk");
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let registry = HandlerRegistry::new();
        let envelope = EventEnvelope::new("ProductDeleted", "{}");

        let err = registry
            .dispatch(&envelope, ctx_for(&envelope))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoHandler(t) if t == "ProductDeleted"));
    }

    #[tokio::test]
    async fn test_typed_decode_failure_is_not_retryable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = HandlerRegistry::new();
        registry
            .register_typed("ProductCreated", move |_event: Created, _ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .unwrap();

        let envelope = EventEnvelope::new("ProductCreated", r#"{"title":"Desk"}"#);
        let err = registry
            .dispatch(&envelope, ctx_for(&envelope))
            .await
            .unwrap_err();

        match err {
            DispatchError::Handler(e) => assert!(!e.is_retryable()),
            other => panic!("expected handler error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_is_retryable() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_typed("ProductCreated", |_event: serde_json::Value, _ctx| async {
                Err(HandlerError::downstream("smtp unavailable"))
            })
            .unwrap();

        let envelope = EventEnvelope::new("ProductCreated", "{}");
        let err = registry
            .dispatch(&envelope, ctx_for(&envelope))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler(HandlerError::Downstream(_))));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_typed("ProductCreated", |_e: serde_json::Value, _ctx| async { Ok(()) })
            .unwrap();
        let err = registry
            .register_typed("ProductCreated", |_e: serde_json::Value, _ctx| async { Ok(()) })
            .unwrap_err();

        assert!(matches!(err, RegistryError::Duplicate(_)));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("ProductCreated"));
    }
}
