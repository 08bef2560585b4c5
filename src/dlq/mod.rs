//! Dead-letter recovery sweeper.
//!
//! Periodically moves every message in the error queue back onto the main
//! queue so it gets another processing attempt. Each cycle:
//!
//! 1. Passively declares the error queue; a missing queue skips the cycle.
//! 2. Skips the cycle when the queue is empty.
//! 3. Fetches one message at a time without auto-ack, republishes it
//!    unchanged through the default exchange to the main queue, then acks it.
//!
//! A message is acked from the error queue only after its republish
//! succeeded. A failing step ends the cycle and closing the channel returns
//! the unacked message to the error queue.
//!
//! A cycle moves at most the number of messages the passive declare
//! reported, so messages that fail again during the sweep wait for the next
//! cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerChannel, BrokerError, DEFAULT_EXCHANGE};
use crate::config::{RabbitMqSettings, SweeperConfig};
use crate::topology::error_queue_name;

/// Sweep errors.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    /// The cycle could not start.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A per-message step failed after `moved` messages were moved.
    #[error("Sweep interrupted after moving {moved} message(s): {source}")]
    Interrupted {
        moved: usize,
        #[source]
        source: BrokerError,
    },
}

/// How a sweep cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The error queue does not exist.
    MissingQueue,
    EmptyQueue,
    /// Every message counted at the start of the cycle was moved.
    Drained,
    /// Cancellation arrived between two messages.
    Cancelled,
}

/// Observable result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub moved: usize,
    pub outcome: SweepOutcome,
}

impl SweepReport {
    fn skipped(outcome: SweepOutcome) -> Self {
        Self { moved: 0, outcome }
    }
}

/// Moves messages from `<main>_error` back to `<main>`.
#[derive(Clone)]
pub struct DeadLetterSweeper {
    broker: Arc<dyn Broker>,
    main_queue: String,
    error_queue: String,
    interval: Duration,
}

impl DeadLetterSweeper {
    /// Sweeper for `main_queue` and its `<main_queue>_error` queue, every 10 seconds.
    pub fn new(broker: Arc<dyn Broker>, main_queue: impl Into<String>) -> Self {
        let main_queue = main_queue.into();
        Self {
            broker,
            error_queue: error_queue_name(&main_queue),
            main_queue,
            interval: Duration::from_secs(10),
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, rabbitmq: &RabbitMqSettings, sweeper: &SweeperConfig) -> Self {
        Self::new(broker, rabbitmq.queue_name.clone()).with_interval(sweeper.interval())
    }

    /// Set the cycle interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn main_queue(&self) -> &str {
        &self.main_queue
    }

    pub fn error_queue(&self) -> &str {
        &self.error_queue
    }

    /// Run one cycle (for testing or manual invocation).
    pub async fn sweep_once(&self) -> Result<SweepReport, SweepError> {
        self.sweep(None).await
    }

    async fn sweep(&self, cancel: Option<&watch::Receiver<bool>>) -> Result<SweepReport, SweepError> {
        let channel = self.broker.open_channel().await?;
        let result = self.sweep_on(channel.as_ref(), cancel).await;

        // Returns any fetched-but-unacked message to the error queue
        if let Err(e) = channel.close().await {
            debug!(queue = %self.error_queue, error = %e, "Closing sweep channel failed");
        }
        result
    }

    async fn sweep_on(
        &self,
        channel: &dyn BrokerChannel,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<SweepReport, SweepError> {
        // Unroutable republishes only surface as errors under confirms
        channel.confirm_select().await?;

        let state = match channel.queue_declare_passive(&self.error_queue).await {
            Ok(state) => state,
            Err(BrokerError::NotFound(_)) => {
                info!(queue = %self.error_queue, "Error queue does not exist, skipping sweep");
                return Ok(SweepReport::skipped(SweepOutcome::MissingQueue));
            }
            Err(e) => return Err(e.into()),
        };

        if state.message_count == 0 {
            debug!(queue = %self.error_queue, "Error queue empty, skipping sweep");
            return Ok(SweepReport::skipped(SweepOutcome::EmptyQueue));
        }

        let budget = state.message_count as usize;
        let mut moved = 0;
        while moved < budget {
            if cancel.map(|c| *c.borrow()).unwrap_or(false) {
                return Ok(SweepReport {
                    moved,
                    outcome: SweepOutcome::Cancelled,
                });
            }

            match self.move_one(channel).await {
                Ok(true) => moved += 1,
                Ok(false) => break,
                Err(source) => {
                    error!(
                        queue = %self.error_queue,
                        target = %self.main_queue,
                        moved,
                        error = %source,
                        "Dead-letter requeue failed, message left in error queue"
                    );
                    return Err(SweepError::Interrupted { moved, source });
                }
            }
        }

        Ok(SweepReport {
            moved,
            outcome: SweepOutcome::Drained,
        })
    }

    /// Move one message. `false` when the error queue is empty.
    async fn move_one(&self, channel: &dyn BrokerChannel) -> Result<bool, BrokerError> {
        let Some(delivery) = channel.basic_get(&self.error_queue).await? else {
            return Ok(false);
        };

        channel
            .basic_publish(DEFAULT_EXCHANGE, &self.main_queue, true, &delivery.message)
            .await?;
        channel.basic_ack(delivery.delivery_tag).await?;
        Ok(true)
    }

    /// Spawn the sweeper as a background task.
    pub fn spawn(self) -> SweeperHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (report_tx, report_rx) = watch::channel(None);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                queue = %self.error_queue,
                target = %self.main_queue,
                interval_secs = self.interval.as_secs(),
                "Dead-letter sweeper started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel_rx.wait_for(|stop| *stop) => break,
                }

                match self.sweep(Some(&cancel_rx)).await {
                    Ok(report) => {
                        if report.moved > 0 {
                            info!(
                                queue = %self.error_queue,
                                target = %self.main_queue,
                                moved = report.moved,
                                "Dead-letter sweep moved messages"
                            );
                        }
                        let _ = report_tx.send(Some(report));
                    }
                    Err(e) => {
                        warn!(queue = %self.error_queue, error = %e, "Dead-letter sweep failed");
                    }
                }
            }

            info!(queue = %self.error_queue, "Dead-letter sweeper stopped");
        });

        SweeperHandle {
            cancel: cancel_tx,
            reports: report_rx,
            task,
        }
    }
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    cancel: watch::Sender<bool>,
    reports: watch::Receiver<Option<SweepReport>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Report of the most recent successful cycle.
    pub fn last_report(&self) -> Option<SweepReport> {
        *self.reports.borrow()
    }

    /// Wait for the next completed cycle.
    pub async fn next_report(&mut self) -> Option<SweepReport> {
        self.reports.changed().await.ok()?;
        *self.reports.borrow_and_update()
    }

    /// Signal the task to stop and wait for it. An in-flight message move finishes first.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Dead-letter sweeper task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, Message};
    use crate::topology::TopologyManager;
    use lapin::types::{AMQPValue, FieldTable};
    use lapin::BasicProperties;

    const QUEUE: &str = "orders.queue";
    const ERROR_QUEUE: &str = "orders.queue_error";

    async fn setup() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        TopologyManager::new(Arc::new(broker.clone()))
            .ensure_topology("orders", QUEUE)
            .await
            .unwrap();
        broker
    }

    fn failed_message(i: usize) -> Message {
        let mut headers = FieldTable::default();
        headers.insert("x-attempt".into(), AMQPValue::LongLongInt(i as i64));
        Message {
            properties: BasicProperties::default()
                .with_message_id(format!("m{i}").into())
                .with_type("ProductCreated".into())
                .with_headers(headers),
            body: format!(r#"{{"title":"item-{i}"}}"#).into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_sweep_moves_everything_unchanged() {
        let broker = setup().await;
        let originals: Vec<Message> = (0..5).map(failed_message).collect();
        for message in &originals {
            broker.inject(ERROR_QUEUE, message.clone()).await.unwrap();
        }

        let sweeper = DeadLetterSweeper::new(Arc::new(broker.clone()), QUEUE);
        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(report, SweepReport { moved: 5, outcome: SweepOutcome::Drained });
        assert_eq!(broker.queue_depth(ERROR_QUEUE).await, Some(0));

        let requeued = broker.peek(QUEUE).await;
        assert_eq!(requeued.len(), 5);
        for (original, moved) in originals.iter().zip(&requeued) {
            assert_eq!(moved.body, original.body);
            assert_eq!(moved.properties, original.properties);
        }
        assert_eq!(broker.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_error_queue_moves_nothing() {
        let broker = setup().await;
        let sweeper = DeadLetterSweeper::new(Arc::new(broker.clone()), QUEUE);

        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(report, SweepReport { moved: 0, outcome: SweepOutcome::EmptyQueue });
        assert!(broker.ack_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_error_queue_is_a_no_op() {
        let broker = InMemoryBroker::new();
        let sweeper = DeadLetterSweeper::new(Arc::new(broker.clone()), QUEUE);

        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(report.moved, 0);
        assert_eq!(report.outcome, SweepOutcome::MissingQueue);
        assert_eq!(broker.queue_count().await, 0);
    }

    #[tokio::test]
    async fn test_republish_failure_leaves_message_in_error_queue() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        // Error queue exists, main queue does not
        channel
            .queue_declare(&crate::broker::QueueSpec::durable(ERROR_QUEUE))
            .await
            .unwrap();
        channel.close().await.unwrap();
        broker.inject(ERROR_QUEUE, failed_message(1)).await.unwrap();

        let sweeper = DeadLetterSweeper::new(Arc::new(broker.clone()), QUEUE);
        let err = sweeper.sweep_once().await.unwrap_err();

        assert!(matches!(err, SweepError::Interrupted { moved: 0, .. }));
        assert_eq!(broker.queue_depth(ERROR_QUEUE).await, Some(1));
        assert!(broker.ack_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_main_queue_deleted_keeps_message_in_error_queue() {
        let broker = setup().await;
        broker.inject(ERROR_QUEUE, failed_message(1)).await.unwrap();
        broker.delete_queue(QUEUE).await;

        let sweeper = DeadLetterSweeper::new(Arc::new(broker.clone()), QUEUE);
        let err = sweeper.sweep_once().await.unwrap_err();

        assert!(matches!(err, SweepError::Interrupted { moved: 0, .. }));
        assert_eq!(broker.queue_depth(ERROR_QUEUE).await, Some(1));
        assert_eq!(broker.queue_depth(QUEUE).await, None);
    }

    #[tokio::test]
    async fn test_broker_down_is_error() {
        let broker = setup().await;
        broker.set_available(false).await;

        let sweeper = DeadLetterSweeper::new(Arc::new(broker), QUEUE);
        let err = sweeper.sweep_once().await.unwrap_err();
        assert!(matches!(err, SweepError::Broker(BrokerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_spawned_sweeper_reports_and_stops() {
        let broker = setup().await;
        for i in 0..3 {
            broker.inject(ERROR_QUEUE, failed_message(i)).await.unwrap();
        }

        let mut handle = DeadLetterSweeper::new(Arc::new(broker.clone()), QUEUE)
            .with_interval(Duration::from_secs(3600))
            .spawn();

        let report = tokio::time::timeout(Duration::from_secs(2), handle.next_report())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.moved, 3);
        assert_eq!(broker.queue_depth(QUEUE).await, Some(3));

        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .unwrap();
    }

    #[test]
    fn test_queue_names() {
        let sweeper = DeadLetterSweeper::new(Arc::new(InMemoryBroker::new()), "notification.service.queue");
        assert_eq!(sweeper.main_queue(), "notification.service.queue");
        assert_eq!(sweeper.error_queue(), "notification.service.queue_error");
    }
}
