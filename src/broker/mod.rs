//! Broker abstraction.
//!
//! This module contains:
//! - `Broker` trait: a shared connection that hands out channels
//! - `BrokerChannel` trait: the AMQP primitives the pipeline needs
//! - Declaration and message types shared by all implementations
//! - Implementations: AMQP (RabbitMQ via lapin), in-memory
//!
//! Components never share a channel. Each one opens its own through
//! `Broker::open_channel`; the connection underneath may be shared.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::{types::AMQPValue, types::FieldTable, BasicProperties};

pub mod amqp;
pub mod memory;

pub use amqp::{AmqpBroker, AmqpChannel};
pub use memory::{AckEvent, InMemoryBroker};

/// Queue argument naming the exchange that receives rejected messages.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering.
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";
/// The AMQP default exchange; routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Broker failures, classified once so components can react by kind.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Connection could not be established or was lost.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// A passive declare or operation referenced a missing entity.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Redeclaration with different parameters.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The channel was closed and cannot be used anymore.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Ack or nack of a tag this channel does not hold.
    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// The broker negatively confirmed a publish.
    #[error("Publish not confirmed: {0}")]
    Nacked(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether the failure is transient infrastructure trouble.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::ChannelClosed(_))
    }
}

/// Exchange types the pipeline declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Fanout,
    Direct,
}

/// Exchange declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable fanout exchange.
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Where rejected messages go: (exchange, routing key).
    pub dead_letter: Option<(String, String)>,
}

impl QueueSpec {
    /// Durable, non-exclusive, non-auto-delete queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter: None,
        }
    }

    /// Route rejected messages to `queue` through the default exchange.
    pub fn dead_letter_to_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter = Some((DEFAULT_EXCHANGE.to_string(), queue.into()));
        self
    }

    /// Queue arguments as sent to the broker.
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();
        if let Some((exchange, routing_key)) = &self.dead_letter {
            args.insert(
                DEAD_LETTER_EXCHANGE_ARG.into(),
                AMQPValue::LongString(exchange.as_str().into()),
            );
            args.insert(
                DEAD_LETTER_ROUTING_KEY_ARG.into(),
                AMQPValue::LongString(routing_key.as_str().into()),
            );
        }
        FieldTable::from(args)
    }
}

/// Queue state reported by a declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueState {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message as published: properties plus body bytes.
#[derive(Debug, Clone)]
pub struct Message {
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// A message handed out by the broker and awaiting ack/nack.
///
/// `delivery_tag` is scoped to the channel that produced it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

/// Stream of deliveries from `basic_consume`.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Connection-level handle shared across components.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new channel owned by the caller.
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;
}

/// Channel-level AMQP operations.
///
/// A channel is owned by exactly one component. Callers that share one
/// across tasks must serialize access themselves.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueState>;

    /// Passive declare. `NotFound` when the queue does not exist.
    async fn queue_declare_passive(&self, queue: &str) -> Result<QueueState>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries on this channel.
    async fn basic_qos(&self, prefetch: u16) -> Result<()>;

    /// Put the channel in publisher-confirm mode.
    async fn confirm_select(&self) -> Result<()>;

    /// Publish and wait for the broker confirm when confirm mode is on.
    ///
    /// With `mandatory` on a channel in confirm mode, a message no queue
    /// accepts fails with `NotFound` instead of being dropped. Without
    /// confirms the return is never observed.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &Message,
    ) -> Result<()>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Fetch one message without auto-ack. `None` when the queue is empty.
    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Close the channel. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_queue_spec() {
        let spec = QueueSpec::durable("orders");
        assert!(spec.durable);
        assert!(!spec.exclusive);
        assert!(!spec.auto_delete);
        assert!(spec.arguments().inner().is_empty());
    }

    #[test]
    fn test_dead_letter_arguments() {
        let spec = QueueSpec::durable("orders").dead_letter_to_queue("orders_error");
        let args = spec.arguments();
        let inner = args.inner();

        assert_eq!(
            inner.get(DEAD_LETTER_EXCHANGE_ARG),
            Some(&AMQPValue::LongString("".into()))
        );
        assert_eq!(
            inner.get(DEAD_LETTER_ROUTING_KEY_ARG),
            Some(&AMQPValue::LongString("orders_error".into()))
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Unavailable("down".into()).is_transient());
        assert!(BrokerError::ChannelClosed("closed".into()).is_transient());
        assert!(!BrokerError::PreconditionFailed("args".into()).is_transient());
        assert!(!BrokerError::NotFound("queue".into()).is_transient());
    }
}
