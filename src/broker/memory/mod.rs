//! In-memory broker for standalone mode and tests.
//!
//! Models the subset of RabbitMQ behavior the pipeline relies on:
//! - durable fanout/direct exchanges and the default exchange
//! - queue declaration with precondition checks on redeclare
//! - passive declares that fail (and close the channel) for missing queues
//! - per-channel delivery tags, prefetch, ack/nack and dead-lettering
//! - unacknowledged deliveries returning to the queue when a channel closes
//!
//! Every ack and nack is recorded so tests can assert that a delivery was
//! settled exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::types::{AMQPValue, FieldTable};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{
    Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec,
    Message, QueueSpec, QueueState, Result, DEFAULT_EXCHANGE,
};

/// Header naming the queue a dead-lettered message was rejected from.
pub const FIRST_DEATH_QUEUE_HEADER: &str = "x-first-death-queue";
/// Header naming why a message was dead-lettered.
pub const FIRST_DEATH_REASON_HEADER: &str = "x-first-death-reason";

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack { requeue: bool },
}

/// One settlement recorded by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEvent {
    pub channel_id: u64,
    pub delivery_tag: u64,
    pub queue: String,
    pub message_id: Option<String>,
    pub outcome: AckOutcome,
}

#[derive(Debug, Clone)]
struct Stored {
    message: Message,
    redelivered: bool,
    exchange: String,
    routing_key: String,
}

struct QueueData {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    consumers: u32,
}

struct ExchangeData {
    spec: ExchangeSpec,
    bindings: Vec<(String, String)>,
}

struct Unacked {
    queue: String,
    stored: Stored,
    via_consumer: bool,
}

#[derive(Default)]
struct ChannelData {
    next_tag: u64,
    prefetch: Option<u16>,
    confirms: bool,
    unacked: HashMap<u64, Unacked>,
    consumers: HashMap<String, String>,
}

impl ChannelData {
    fn consumer_in_flight(&self) -> usize {
        self.unacked.values().filter(|u| u.via_consumer).count()
    }
}

#[derive(Default)]
struct State {
    available: bool,
    next_channel_id: u64,
    exchanges: HashMap<String, ExchangeData>,
    queues: HashMap<String, QueueData>,
    channels: HashMap<u64, ChannelData>,
    ack_log: Vec<AckEvent>,
    invalid_settlements: usize,
    publish_count: usize,
}

impl State {
    fn channel(&mut self, id: u64) -> Result<&mut ChannelData> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| BrokerError::ChannelClosed(format!("channel {} is closed", id)))
    }

    /// Close a channel after a channel-level error, as the broker would.
    fn fail_channel(&mut self, id: u64, error: BrokerError) -> BrokerError {
        self.close_channel(id);
        error
    }

    fn close_channel(&mut self, id: u64) {
        let Some(mut channel) = self.channels.remove(&id) else {
            return;
        };

        for queue in channel.consumers.values() {
            if let Some(q) = self.queues.get_mut(queue) {
                q.consumers = q.consumers.saturating_sub(1);
            }
        }

        // Return in reverse tag order so the oldest lands at the front
        let mut tags: Vec<u64> = channel.unacked.keys().copied().collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = channel.unacked.remove(&tag) {
                if let Some(q) = self.queues.get_mut(&unacked.queue) {
                    let mut stored = unacked.stored;
                    stored.redelivered = true;
                    q.ready.push_front(stored);
                }
            }
        }
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> std::result::Result<usize, BrokerError> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let data = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::NotFound(format!("no exchange '{}'", exchange)))?;
            data.bindings
                .iter()
                .filter(|(_, key)| match data.spec.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Direct => key == routing_key,
                })
                .map(|(queue, _)| queue.clone())
                .collect()
        };

        let mut delivered = 0;
        for queue in targets {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_back(Stored {
                    message: message.clone(),
                    redelivered: false,
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn settle(&mut self, channel_id: u64, tag: u64, outcome: AckOutcome) -> Result<()> {
        let removed = self.channel(channel_id)?.unacked.remove(&tag);
        let unacked = match removed {
            Some(unacked) => unacked,
            None => {
                self.invalid_settlements += 1;
                return Err(self.fail_channel(channel_id, BrokerError::UnknownDeliveryTag(tag)));
            }
        };

        self.ack_log.push(AckEvent {
            channel_id,
            delivery_tag: tag,
            queue: unacked.queue.clone(),
            message_id: unacked
                .stored
                .message
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
            outcome,
        });

        match outcome {
            AckOutcome::Ack => {}
            AckOutcome::Nack { requeue: true } => {
                if let Some(q) = self.queues.get_mut(&unacked.queue) {
                    let mut stored = unacked.stored;
                    stored.redelivered = true;
                    q.ready.push_front(stored);
                }
            }
            AckOutcome::Nack { requeue: false } => {
                let dead_letter = self
                    .queues
                    .get(&unacked.queue)
                    .and_then(|q| q.spec.dead_letter.clone());
                if let Some((exchange, routing_key)) = dead_letter {
                    let message = dead_lettered(unacked.stored.message, &unacked.queue);
                    if let Err(e) = self.route(&exchange, &routing_key, &message) {
                        debug!(error = %e, queue = %unacked.queue, "Dead-letter target missing, message dropped");
                    }
                }
            }
        }
        Ok(())
    }

    fn take(&mut self, channel_id: u64, queue: &str, via_consumer: bool) -> Result<Option<Delivery>> {
        let stored = match self.queues.get_mut(queue) {
            Some(q) => q.ready.pop_front(),
            None => {
                return Err(self.fail_channel(
                    channel_id,
                    BrokerError::NotFound(format!("no queue '{}'", queue)),
                ))
            }
        };
        let Some(stored) = stored else {
            return Ok(None);
        };

        let channel = self.channel(channel_id)?;
        channel.next_tag += 1;
        let tag = channel.next_tag;
        let delivery = Delivery {
            delivery_tag: tag,
            redelivered: stored.redelivered,
            exchange: stored.exchange.clone(),
            routing_key: stored.routing_key.clone(),
            message: stored.message.clone(),
        };
        channel.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                stored,
                via_consumer,
            },
        );
        Ok(Some(delivery))
    }
}

/// Mark a message the way the broker does when it dead-letters a rejection.
fn dead_lettered(mut message: Message, queue: &str) -> Message {
    let mut headers = message
        .properties
        .headers()
        .clone()
        .unwrap_or_else(FieldTable::default);
    if !headers.inner().contains_key(FIRST_DEATH_QUEUE_HEADER) {
        headers.insert(
            FIRST_DEATH_QUEUE_HEADER.into(),
            AMQPValue::LongString(queue.into()),
        );
        headers.insert(
            FIRST_DEATH_REASON_HEADER.into(),
            AMQPValue::LongString("rejected".into()),
        );
    }
    message.properties = message.properties.with_headers(headers);
    message
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

/// In-process broker shared by cloning.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    available: true,
                    ..Default::default()
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Simulate an outage. While unavailable, opening channels and publishing fail.
    pub async fn set_available(&self, available: bool) {
        self.shared.state.lock().await.available = available;
        self.shared.changed.notify_waiters();
    }

    /// Messages ready for delivery in `queue`, or `None` if it does not exist.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        let state = self.shared.state.lock().await;
        state.queues.get(queue).map(|q| q.ready.len())
    }

    /// Deliveries from `queue` that are still waiting for ack/nack.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        let state = self.shared.state.lock().await;
        state
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Snapshot of the ready messages in `queue`, front first.
    pub async fn peek(&self, queue: &str) -> Vec<Message> {
        let state = self.shared.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Declared specification of `queue`.
    pub async fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        let state = self.shared.state.lock().await;
        state.queues.get(queue).map(|q| q.spec.clone())
    }

    /// Queues bound to `exchange`.
    pub async fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        let state = self.shared.state.lock().await;
        state
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    /// Drop `queue` with its messages and bindings, as an operator would.
    pub async fn delete_queue(&self, queue: &str) -> bool {
        let mut state = self.shared.state.lock().await;
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != queue);
        }
        state.queues.remove(queue).is_some()
    }

    pub async fn exchange_count(&self) -> usize {
        self.shared.state.lock().await.exchanges.len()
    }

    pub async fn queue_count(&self) -> usize {
        self.shared.state.lock().await.queues.len()
    }

    /// Every settlement made so far, in order.
    pub async fn ack_log(&self) -> Vec<AckEvent> {
        self.shared.state.lock().await.ack_log.clone()
    }

    /// Ack/nack attempts that referenced a tag the channel did not hold.
    pub async fn invalid_settlements(&self) -> usize {
        self.shared.state.lock().await.invalid_settlements
    }

    /// Messages accepted by `basic_publish`.
    pub async fn publish_count(&self) -> usize {
        self.shared.state.lock().await.publish_count
    }

    /// Open channels.
    pub async fn channel_count(&self) -> usize {
        self.shared.state.lock().await.channels.len()
    }

    /// Put a raw message directly on a queue, bypassing exchanges.
    pub async fn inject(&self, queue: &str, message: Message) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("no queue '{}'", queue)))?;
        q.ready.push_back(Stored {
            message,
            redelivered: false,
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: queue.to_string(),
        });
        drop(state);
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let mut state = self.shared.state.lock().await;
        if !state.available {
            return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
        }
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.channels.insert(id, ChannelData::default());

        Ok(Box::new(InMemoryChannel {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Channel on an `InMemoryBroker`.
pub struct InMemoryChannel {
    id: u64,
    shared: Arc<Shared>,
}

impl InMemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Cursor driving a consumer stream.
struct ConsumeCursor {
    shared: Arc<Shared>,
    channel_id: u64,
    queue: String,
    consumer_tag: String,
}

impl ConsumeCursor {
    async fn next_delivery(&self) -> Option<Result<Delivery>> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().await;
                if !state.available {
                    state.close_channel(self.channel_id);
                    return Some(Err(BrokerError::Unavailable(
                        "in-memory broker is down".to_string(),
                    )));
                }
                let channel = match state.channels.get(&self.channel_id) {
                    Some(channel) => channel,
                    None => return None,
                };
                if !channel.consumers.contains_key(&self.consumer_tag) {
                    return None;
                }
                let limit_reached = channel
                    .prefetch
                    .map(|p| p > 0 && channel.consumer_in_flight() >= p as usize)
                    .unwrap_or(false);

                if !limit_reached {
                    match state.take(self.channel_id, &self.queue, true) {
                        Ok(Some(delivery)) => return Some(Ok(delivery)),
                        Ok(None) => {}
                        Err(e) => return Some(Err(e)),
                    }
                }
            }

            notified.await;
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.channel(self.id)?;

        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing.spec != *spec {
                let error = BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for exchange '{}'",
                    spec.name
                ));
                return Err(state.fail_channel(self.id, error));
            }
            return Ok(());
        }

        state.exchanges.insert(
            spec.name.clone(),
            ExchangeData {
                spec: spec.clone(),
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueState> {
        let mut state = self.shared.state.lock().await;
        state.channel(self.id)?;

        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.spec != *spec {
                let error = BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{}'",
                    spec.name
                ));
                return Err(state.fail_channel(self.id, error));
            }
            return Ok(QueueState {
                message_count: existing.ready.len() as u32,
                consumer_count: existing.consumers,
            });
        }

        state.queues.insert(
            spec.name.clone(),
            QueueData {
                spec: spec.clone(),
                ready: VecDeque::new(),
                consumers: 0,
            },
        );
        Ok(QueueState::default())
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<QueueState> {
        let mut state = self.shared.state.lock().await;
        state.channel(self.id)?;

        match state.queues.get(queue) {
            Some(q) => Ok(QueueState {
                message_count: q.ready.len() as u32,
                consumer_count: q.consumers,
            }),
            None => {
                let error = BrokerError::NotFound(format!("no queue '{}'", queue));
                Err(state.fail_channel(self.id, error))
            }
        }
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.channel(self.id)?;

        if !state.queues.contains_key(queue) {
            let error = BrokerError::NotFound(format!("no queue '{}'", queue));
            return Err(state.fail_channel(self.id, error));
        }
        let Some(data) = state.exchanges.get_mut(exchange) else {
            let error = BrokerError::NotFound(format!("no exchange '{}'", exchange));
            return Err(state.fail_channel(self.id, error));
        };

        let binding = (queue.to_string(), routing_key.to_string());
        if !data.bindings.contains(&binding) {
            data.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.channel(self.id)?.prefetch = Some(prefetch);
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.channel(self.id)?.confirms = true;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &Message,
    ) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if !state.available {
            state.close_channel(self.id);
            return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
        }
        state.channel(self.id)?;

        let delivered = match state.route(exchange, routing_key, message) {
            Ok(delivered) => delivered,
            Err(e) => return Err(state.fail_channel(self.id, e)),
        };
        // Without confirms a returned message goes unnoticed, like on RabbitMQ
        let confirms = state.channel(self.id)?.confirms;
        if delivered == 0 && mandatory && confirms {
            return Err(BrokerError::NotFound(format!(
                "message returned unroutable: exchange '{}', routing key '{}'",
                exchange, routing_key
            )));
        }
        state.publish_count += 1;
        drop(state);

        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        {
            let mut state = self.shared.state.lock().await;
            state.channel(self.id)?;
            match state.queues.get_mut(queue) {
                Some(q) => q.consumers += 1,
                None => {
                    let error = BrokerError::NotFound(format!("no queue '{}'", queue));
                    return Err(state.fail_channel(self.id, error));
                }
            }
            state
                .channel(self.id)?
                .consumers
                .insert(consumer_tag.to_string(), queue.to_string());
        }

        let cursor = ConsumeCursor {
            shared: Arc::clone(&self.shared),
            channel_id: self.id,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
        };

        Ok(futures::stream::unfold(cursor, |cursor| async move {
            let item = cursor.next_delivery().await?;
            Some((item, cursor))
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let queue = state.channel(self.id)?.consumers.remove(consumer_tag);
        if let Some(queue) = queue {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.consumers = q.consumers.saturating_sub(1);
            }
        }
        drop(state);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut state = self.shared.state.lock().await;
        state.channel(self.id)?;
        state.take(self.id, queue, false)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let result = state.settle(self.id, delivery_tag, AckOutcome::Ack);
        drop(state);
        self.shared.changed.notify_waiters();
        result
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let result = state.settle(self.id, delivery_tag, AckOutcome::Nack { requeue });
        drop(state);
        self.shared.changed.notify_waiters();
        result
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.close_channel(self.id);
        drop(state);
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests;
