//! Generic consumer loop.
//!
//! One task per `ConsumerRegistration`. The task owns its channel, sets the
//! prefetch, and settles every delivery exactly once:
//!
//! | Outcome                          | Settlement          |
//! |----------------------------------|---------------------|
//! | envelope decode failure          | ack (discarded)     |
//! | no handler for the event type    | ack (discarded)     |
//! | handler payload decode failure   | ack (discarded)     |
//! | handler success                  | ack                 |
//! | handler error or timeout         | nack, no requeue    |
//!
//! Rejected deliveries reach the error queue through the main queue's
//! dead-letter arguments.
//!
//! If the delivery stream ends or fails, the task reopens a channel and
//! resumes consuming with exponential backoff until stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::broker::{Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream};
use crate::config::{ConsumerConfig, RabbitMqSettings};
use crate::envelope::EventEnvelope;
use crate::handler::{
    default_context_factory, ContextFactory, DeliveryInfo, HandlerError, HandlerRegistry,
};
use crate::utils::retry::reconnect_backoff;

/// Consumer errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Consumer task failed: {0}")]
    Task(String),
}

/// What one consumer task listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRegistration {
    /// Event type assumed for deliveries that carry no `type` property.
    pub event_type: String,
    pub queue_name: String,
    pub exchange_name: String,
}

impl ConsumerRegistration {
    pub fn new(
        event_type: impl Into<String>,
        queue_name: impl Into<String>,
        exchange_name: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            queue_name: queue_name.into(),
            exchange_name: exchange_name.into(),
        }
    }
}

/// Tunables for a consumer task.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Unacknowledged deliveries allowed on the channel.
    pub prefetch: u16,
    /// How long `stop` lets an in-flight handler run.
    pub shutdown_grace: Duration,
    /// Per-delivery handler limit.
    pub handler_timeout: Option<Duration>,
    pub reconnect_backoff: ExponentialBuilder,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            shutdown_grace: Duration::from_secs(30),
            handler_timeout: None,
            reconnect_backoff: reconnect_backoff(),
        }
    }
}

impl ConsumerOptions {
    pub fn from_config(rabbitmq: &RabbitMqSettings, consumer: &ConsumerConfig) -> Self {
        Self {
            prefetch: rabbitmq.prefetch,
            shutdown_grace: consumer.shutdown_grace(),
            handler_timeout: consumer.handler_timeout(),
            ..Default::default()
        }
    }
}

/// Settlement counters for one consumer task.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    nacked: AtomicU64,
    discarded: AtomicU64,
    reconnects: AtomicU64,
}

impl ConsumerStats {
    /// Deliveries acked after their handler succeeded.
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    /// Deliveries rejected to the error queue.
    pub fn nacked(&self) -> u64 {
        self.nacked.load(Ordering::Relaxed)
    }

    /// Deliveries acked without processing (undecodable or unhandled).
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acked,
    Nacked,
    Discarded,
    /// Shutdown grace expired before the handler finished.
    Abandoned,
}

/// Why draining a stream stopped.
enum StreamExit {
    Shutdown,
    Lost,
}

/// Starts consumer tasks.
pub struct ConsumerLoop {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    options: ConsumerOptions,
    context_factory: ContextFactory,
}

impl ConsumerLoop {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            broker,
            registry,
            options: ConsumerOptions::default(),
            context_factory: default_context_factory(),
        }
    }

    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the per-delivery context construction.
    pub fn with_context_factory(mut self, factory: ContextFactory) -> Self {
        self.context_factory = factory;
        self
    }

    /// Start consuming for `registration`.
    ///
    /// The first subscription happens before this returns, so a missing
    /// queue surfaces here instead of in the reconnect loop.
    pub async fn start(&self, registration: ConsumerRegistration) -> Result<ConsumerHandle, ConsumerError> {
        let consumer_tag = format!(
            "herald-{}-{}",
            registration.event_type,
            Uuid::new_v4().simple()
        );
        let (channel, stream) = subscribe(
            self.broker.as_ref(),
            &registration.queue_name,
            &consumer_tag,
            self.options.prefetch,
        )
        .await?;

        info!(
            queue = %registration.queue_name,
            exchange = %registration.exchange_name,
            event_type = %registration.event_type,
            prefetch = self.options.prefetch,
            "Consumer started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(ConsumerStats::default());
        let worker = Worker {
            broker: Arc::clone(&self.broker),
            registry: Arc::clone(&self.registry),
            options: self.options.clone(),
            context_factory: Arc::clone(&self.context_factory),
            registration,
            consumer_tag,
            stats: Arc::clone(&stats),
            shutdown: shutdown_rx,
        };

        let task = tokio::spawn(worker.run(channel, stream));

        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            task,
            stats,
        })
    }
}

/// Handle to a running consumer task.
///
/// Dropping the handle stops the task once the current delivery is settled.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<ConsumerStats>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop accepting deliveries, let the in-flight handler finish within the
    /// grace period, then close the channel.
    pub async fn stop(self) -> Result<Arc<ConsumerStats>, ConsumerError> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| ConsumerError::Task(e.to_string()))?;
        Ok(self.stats)
    }
}

async fn subscribe(
    broker: &dyn Broker,
    queue: &str,
    consumer_tag: &str,
    prefetch: u16,
) -> Result<(Box<dyn BrokerChannel>, DeliveryStream), BrokerError> {
    let channel = broker.open_channel().await?;
    channel.basic_qos(prefetch).await?;
    let stream = channel.basic_consume(queue, consumer_tag).await?;
    Ok((channel, stream))
}

/// Resolves once shutdown was requested and the grace period elapsed.
async fn grace_expired(mut shutdown: watch::Receiver<bool>, grace: Duration) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone: no one can request shutdown anymore
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(grace).await;
}

struct Worker {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    options: ConsumerOptions,
    context_factory: ContextFactory,
    registration: ConsumerRegistration,
    consumer_tag: String,
    stats: Arc<ConsumerStats>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(mut self, channel: Box<dyn BrokerChannel>, stream: DeliveryStream) {
        let queue = self.registration.queue_name.clone();
        let mut current = Some((channel, stream));
        let mut backoff = self.options.reconnect_backoff.build();

        loop {
            let Some((channel, mut stream)) = current.take() else {
                break;
            };

            let exit = self.drain(channel.as_ref(), &mut stream).await;
            drop(stream);

            if matches!(exit, StreamExit::Shutdown) {
                if let Err(e) = channel.basic_cancel(&self.consumer_tag).await {
                    debug!(queue = %queue, error = %e, "Cancel on shutdown failed");
                }
                if let Err(e) = channel.close().await {
                    debug!(queue = %queue, error = %e, "Close on shutdown failed");
                }
                break;
            }

            // Unacked deliveries return to the queue when the channel closes
            let _ = channel.close().await;
            info!(queue = %queue, "Consumer stream ended, reconnecting");

            current = self.reconnect(&mut backoff).await;
        }

        info!(queue = %queue, "Consumer stopped");
    }

    async fn reconnect(
        &mut self,
        backoff: &mut ExponentialBackoff,
    ) -> Option<(Box<dyn BrokerChannel>, DeliveryStream)> {
        let queue = self.registration.queue_name.clone();
        loop {
            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.wait_for(|stop| *stop) => return None,
            }
            if self.stopping() {
                return None;
            }

            match subscribe(
                self.broker.as_ref(),
                &queue,
                &self.consumer_tag,
                self.options.prefetch,
            )
            .await
            {
                Ok(subscription) => {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    *backoff = self.options.reconnect_backoff.build();
                    info!(queue = %queue, "Consumer reconnected");
                    return Some(subscription);
                }
                Err(e) => {
                    error!(
                        queue = %queue,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to set up consumer, retrying after backoff"
                    );
                }
            }
        }
    }

    async fn drain(&mut self, channel: &dyn BrokerChannel, stream: &mut DeliveryStream) -> StreamExit {
        loop {
            if self.stopping() {
                return StreamExit::Shutdown;
            }

            let next = tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => return StreamExit::Shutdown,
                next = stream.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(
                        queue = %self.registration.queue_name,
                        error = %e,
                        "Consumer delivery error, will reconnect"
                    );
                    return StreamExit::Lost;
                }
                None => return StreamExit::Lost,
            };

            match self.process(channel, delivery).await {
                Ok(Settlement::Abandoned) => return StreamExit::Shutdown,
                Ok(_) => {}
                Err(e) => {
                    error!(
                        queue = %self.registration.queue_name,
                        error = %e,
                        "Settlement failed, will reconnect"
                    );
                    return StreamExit::Lost;
                }
            }
        }
    }

    /// Decode, dispatch and settle one delivery.
    async fn process(&self, channel: &dyn BrokerChannel, delivery: Delivery) -> Result<Settlement, BrokerError> {
        let tag = delivery.delivery_tag;
        let queue = &self.registration.queue_name;

        let envelope = match EventEnvelope::from_message(&delivery.message, Some(&self.registration.event_type)) {
            Ok(envelope) => envelope,
            Err(e) => {
                let props = &delivery.message.properties;
                warn!(
                    queue = %queue,
                    event_type = ?props.kind().as_ref().map(|k| k.as_str()),
                    message_id = ?props.message_id().as_ref().map(|m| m.as_str()),
                    error = %e,
                    "Undecodable delivery discarded"
                );
                channel.basic_ack(tag).await?;
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                return Ok(Settlement::Discarded);
            }
        };

        let span = tracing::info_span!(
            "consumer.delivery",
            queue = %queue,
            event_type = %envelope.event_type,
            message_id = %envelope.message_id,
            redelivered = delivery.redelivered,
        );

        self.settle(channel, &delivery, envelope).instrument(span).await
    }

    async fn settle(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
        envelope: EventEnvelope,
    ) -> Result<Settlement, BrokerError> {
        let tag = delivery.delivery_tag;

        let Some(handler) = self.registry.get(&self.registration.event_type) else {
            warn!(
                registration = %self.registration.event_type,
                "No handler registered, delivery discarded"
            );
            channel.basic_ack(tag).await?;
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return Ok(Settlement::Discarded);
        };

        let ctx = (self.context_factory)(DeliveryInfo {
            queue: self.registration.queue_name.clone(),
            delivery_tag: tag,
            redelivered: delivery.redelivered,
            event_type: envelope.event_type.clone(),
            message_id: envelope.message_id,
            correlation_id: envelope.correlation_id,
        });

        let handling = async {
            match self.options.handler_timeout {
                Some(limit) => match tokio::time::timeout(limit, handler.handle(&envelope, ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::Timeout(limit)),
                },
                None => handler.handle(&envelope, ctx).await,
            }
        };

        let result = tokio::select! {
            result = handling => result,
            _ = grace_expired(self.shutdown.clone(), self.options.shutdown_grace) => {
                warn!(
                    grace_ms = %self.options.shutdown_grace.as_millis(),
                    "Shutdown grace expired, delivery left unacknowledged"
                );
                return Ok(Settlement::Abandoned);
            }
        };

        match result {
            Ok(()) => {
                channel.basic_ack(tag).await?;
                self.stats.acked.fetch_add(1, Ordering::Relaxed);
                debug!("Delivery processed");
                Ok(Settlement::Acked)
            }
            Err(e @ HandlerError::Decode(_)) => {
                warn!(error = %e, "Payload rejected by handler, delivery discarded");
                channel.basic_ack(tag).await?;
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                Ok(Settlement::Discarded)
            }
            Err(e) => {
                error!(error = %e, "Handler failed, routing delivery to error queue");
                channel.basic_nack(tag, false).await?;
                self.stats.nacked.fetch_add(1, Ordering::Relaxed);
                Ok(Settlement::Nacked)
            }
        }
    }
}
