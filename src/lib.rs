//! Herald - Cross-service event delivery
//!
//! Moves domain events from a producing service to a consuming service over
//! RabbitMQ with at-least-once semantics:
//!
//! - `outbox`: durable staging of events alongside business writes, plus a relay
//! - `publisher`: persistent, confirmed publication to a fanout exchange
//! - `topology`: idempotent exchange/queue/binding declaration
//! - `consumer`: per-registration receive loop with ack/nack semantics
//! - `dlq`: periodic sweep of the error queue back onto the main queue

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod envelope;
pub mod events;
pub mod handler;
pub mod outbox;
pub mod publisher;
pub mod topology;
pub mod utils;
