//! AMQP (RabbitMQ) broker implementation.
//!
//! Connections come from a `deadpool-lapin` pool shared by every component;
//! each `open_channel` call creates a fresh lapin channel on a pooled
//! connection.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    Channel,
};
use tracing::{debug, info};

use super::{
    Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec,
    Message, QueueSpec, QueueState, Result,
};
use crate::config::RabbitMqSettings;

/// Maximum pooled connections.
const POOL_MAX_SIZE: usize = 10;

/// AMQP reply code for a normal channel close.
const REPLY_SUCCESS: u16 = 200;

/// Map a lapin error onto the broker taxonomy.
pub(crate) fn classify(err: lapin::Error, operation: &str) -> BrokerError {
    let detail = format!("{}: {}", operation, err);
    match &err {
        lapin::Error::ProtocolError(amqp_error) => match amqp_error.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound(detail),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::PreconditionFailed(detail)
            }
            _ => BrokerError::Protocol(detail),
        },
        lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed(detail),
        lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_)
        | lapin::Error::MissingHeartbeatError => BrokerError::Unavailable(detail),
        _ => BrokerError::Protocol(detail),
    }
}

/// RabbitMQ broker backed by a connection pool.
pub struct AmqpBroker {
    pool: Pool,
    connect_timeout: Duration,
}

impl AmqpBroker {
    /// Connect using the configured host, virtual host and credentials.
    pub async fn connect(settings: &RabbitMqSettings) -> Result<Self> {
        Self::connect_uri(&settings.amqp_uri(), settings.connection_timeout()).await
    }

    /// Connect to an explicit AMQP URI.
    pub async fn connect_uri(uri: &str, connect_timeout: Duration) -> Result<Self> {
        let manager = Manager::new(uri.to_string(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_MAX_SIZE)
            .build()
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create pool: {}", e)))?;

        let broker = Self {
            pool,
            connect_timeout,
        };

        // Verify connection
        broker.connection().await?;

        info!(
            connect_timeout_ms = %connect_timeout.as_millis(),
            "Connected to AMQP"
        );

        Ok(broker)
    }

    /// Close the pool; pooled connections are dropped and later requests fail.
    pub fn close(&self) {
        self.pool.close();
        info!("AMQP connection pool closed");
    }

    async fn connection(&self) -> Result<deadpool_lapin::Object> {
        match tokio::time::timeout(self.connect_timeout, self.pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                let e: PoolError = e;
                Err(BrokerError::Unavailable(format!(
                    "Failed to get connection from pool: {}",
                    e
                )))
            }
            Err(_) => Err(BrokerError::Unavailable(format!(
                "Connection attempt timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let conn = self.connection().await?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| classify(e, "create channel"))?;

        debug!(channel_id = channel.id(), "Opened AMQP channel");

        Ok(Box::new(AmqpChannel::new(channel)))
    }
}

/// A single lapin channel.
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    fn convert(delivery: lapin::message::Delivery) -> Delivery {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            message: Message {
                properties: delivery.properties,
                body: delivery.data,
            },
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()> {
        let kind = match spec.kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };

        self.channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(e, &format!("declare exchange '{}'", spec.name)))
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueState> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                spec.arguments(),
            )
            .await
            .map_err(|e| classify(e, &format!("declare queue '{}'", spec.name)))?;

        Ok(QueueState {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<QueueState> {
        let queue_info = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(e, &format!("passive declare queue '{}'", queue)))?;

        Ok(QueueState {
            message_count: queue_info.message_count(),
            consumer_count: queue_info.consumer_count(),
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(e, &format!("bind queue '{}' to '{}'", queue, exchange)))
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| classify(e, "basic.qos"))
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| classify(e, "confirm.select"))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &Message,
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..Default::default()
                },
                &message.body,
                message.properties.clone(),
            )
            .await
            .map_err(|e| classify(e, &format!("publish to '{}'", exchange)))?;

        let confirmation = confirm
            .await
            .map_err(|e| classify(e, "publish confirmation"))?;

        if confirmation.is_nack() {
            return Err(BrokerError::Nacked(format!(
                "exchange '{}', routing key '{}'",
                exchange, routing_key
            )));
        }
        if confirmation.take_message().is_some() {
            return Err(BrokerError::NotFound(format!(
                "message returned unroutable: exchange '{}', routing key '{}'",
                exchange, routing_key
            )));
        }

        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(e, &format!("consume '{}'", queue)))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(AmqpChannel::convert)
                    .map_err(|e| classify(e, "delivery"))
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| classify(e, &format!("cancel consumer '{}'", consumer_tag)))
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| classify(e, &format!("basic.get '{}'", queue)))?;

        Ok(message.map(|m| AmqpChannel::convert(m.delivery)))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| classify(e, "basic.ack"))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| classify(e, "basic.nack"))
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| classify(e, "close channel"))
    }
}
