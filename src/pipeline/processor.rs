//! Message Processor
//!
//! Consumes the main work queue and drives each order through
//! PENDING -> PROCESSING -> COMPLETED | FAILED. Every delivery ends in exactly
//! one broker decision:
//!
//! - ack: completed, duplicate, already failed, or parked in the failed queue
//! - reject (no requeue): retry through the delayed queue
//!
//! Deliveries for the same order are serialized by a per-order lock; across
//! processes the ledger insert and the compare-and-set retry increment are the
//! arbiters.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::adapters::traits::{BrokerChannel, Delivery, OrderStore};
use crate::config::AppConfig;
use crate::coordination::shutdown::ShutdownListener;
use crate::domain::{OrderMessage, OrderStatus};
use crate::error::{OrderflowError, Result};
use crate::pipeline::effect::OrderEffect;
use crate::pipeline::retry::{RetryDecision, RetryPolicy};

/// Configuration for the message processor
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub queue: String,
    pub consumer_tag: String,
    /// Concurrent in-flight deliveries
    pub prefetch: u16,
    pub max_retries: i32,
    /// Where give-ups are published
    pub dead_letter_exchange: String,
    pub failed_key: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default_config())
    }
}

impl ProcessorConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            queue: config.topology.queue.clone(),
            consumer_tag: config.broker.consumer_tag.clone(),
            prefetch: config.broker.prefetch,
            max_retries: config.retry.max_retries,
            dead_letter_exchange: config.topology.dead_letter_exchange.clone(),
            failed_key: config.topology.failed_key.clone(),
        }
    }
}

/// Terminal decision taken for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Effect ran, order COMPLETED, ledger written, acked
    Completed,
    /// Ledger already held the id, acked without running the effect
    Duplicate,
    /// Order was already FAILED, acked
    AlreadyFailed,
    /// Rejected into the delayed retry queue
    Retried { retry_count: i32 },
    /// Marked FAILED, payload parked in the failed queue, acked
    GaveUp { retry_count: i32 },
    /// No order row for the id; parked in the failed queue
    UnknownOrder,
    /// Payload unusable; parked in the failed queue
    Malformed,
    /// Store unreachable; rejected into the delayed queue without using a retry
    Deferred,
}

/// Processor statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProcessorStats {
    pub received: u64,
    pub completed: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub failed: u64,
    pub malformed: u64,
    pub deferred: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProcessorStats {
    fn record(&mut self, outcome: ProcessingOutcome) {
        match outcome {
            ProcessingOutcome::Completed => self.completed += 1,
            ProcessingOutcome::Duplicate | ProcessingOutcome::AlreadyFailed => {
                self.duplicates += 1
            }
            ProcessingOutcome::Retried { .. } => self.retried += 1,
            ProcessingOutcome::GaveUp { .. } | ProcessingOutcome::UnknownOrder => {
                self.failed += 1
            }
            ProcessingOutcome::Malformed => self.malformed += 1,
            ProcessingOutcome::Deferred => self.deferred += 1,
        }
        self.last_processed_at = Some(Utc::now());
    }
}

/// Why [`MessageProcessor::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
    /// The delivery stream ended (connection or channel lost)
    StreamClosed,
}

/// Message processor
pub struct MessageProcessor {
    config: ProcessorConfig,
    store: Arc<dyn OrderStore>,
    effect: Arc<dyn OrderEffect>,
    policy: RetryPolicy,
    order_locks: DashMap<String, Arc<Mutex<()>>>,
    stats: Arc<RwLock<ProcessorStats>>,
}

impl MessageProcessor {
    pub fn new(
        config: ProcessorConfig,
        store: Arc<dyn OrderStore>,
        effect: Arc<dyn OrderEffect>,
    ) -> Self {
        let policy = RetryPolicy::new(config.max_retries);
        Self {
            config,
            store,
            effect,
            policy,
            order_locks: DashMap::new(),
            stats: Arc::new(RwLock::new(ProcessorStats::default())),
        }
    }

    pub async fn stats(&self) -> ProcessorStats {
        self.stats.read().await.clone()
    }

    /// Shared handle for readers outside the processor (health endpoint)
    pub fn stats_handle(&self) -> Arc<RwLock<ProcessorStats>> {
        self.stats.clone()
    }

    /// Consume until shutdown or until the delivery stream ends.
    pub async fn run(
        &self,
        channel: Arc<dyn BrokerChannel>,
        shutdown: ShutdownListener,
    ) -> Result<RunExit> {
        let deliveries = channel
            .consume(
                &self.config.queue,
                &self.config.consumer_tag,
                self.config.prefetch,
            )
            .await?;

        info!(
            "Consuming {} (prefetch {}, max retries {})",
            self.config.queue, self.config.prefetch, self.config.max_retries
        );

        let mut stop = shutdown.clone();
        let channel = &channel;
        deliveries
            .take_until(async move { stop.wait().await })
            .for_each_concurrent(usize::from(self.config.prefetch.max(1)), |item| async move {
                match item {
                    Ok(delivery) => {
                        let tag = delivery.delivery_tag;
                        if let Err(e) = self.handle(channel.as_ref(), delivery).await {
                            error!("Delivery {} left undecided: {}", tag, e);
                            self.stats.write().await.last_error = Some(e.to_string());
                        }
                    }
                    Err(e) => warn!("Consumer stream error: {}", e),
                }
            })
            .await;

        if shutdown.is_requested() {
            info!("Consumer stopped for shutdown");
            Ok(RunExit::Shutdown)
        } else {
            warn!("Delivery stream closed");
            Ok(RunExit::StreamClosed)
        }
    }

    /// Process one delivery and issue its broker decision.
    ///
    /// An `Err` means the decision itself could not be sent; the broker
    /// will redeliver once the channel is gone.
    pub async fn handle(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
    ) -> Result<ProcessingOutcome> {
        self.stats.write().await.received += 1;

        let message = match OrderMessage::parse(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed delivery {}: {}", delivery.delivery_tag, e);
                self.route_to_failed(channel, &delivery).await?;
                self.stats.write().await.record(ProcessingOutcome::Malformed);
                return Ok(ProcessingOutcome::Malformed);
            }
        };

        info!(
            "Received order {}{}",
            message.order_id,
            if delivery.redelivered { " (redelivered)" } else { "" }
        );

        let lock = self
            .order_locks
            .entry(message.order_id.clone())
            .or_default()
            .clone();
        let outcome = {
            let _guard = lock.lock().await;
            self.process(channel, &delivery, &message.order_id).await
        };
        drop(lock);
        self.order_locks
            .remove_if(&message.order_id, |_, lock| Arc::strong_count(lock) == 1);

        let outcome = outcome?;
        self.stats.write().await.record(outcome);
        Ok(outcome)
    }

    async fn process(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
        order_id: &str,
    ) -> Result<ProcessingOutcome> {
        match self.store.is_processed(order_id).await {
            Ok(true) => {
                debug!("Order {} already processed, acknowledging", order_id);
                channel.ack(delivery.delivery_tag).await?;
                return Ok(ProcessingOutcome::Duplicate);
            }
            Ok(false) => {}
            Err(e) => return self.defer(channel, delivery, order_id, e).await,
        }

        let order = match self.store.get_order(order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                let e = OrderflowError::OrderNotFound(order_id.to_string());
                error!("{}, parking delivery", e);
                self.route_to_failed(channel, delivery).await?;
                return Ok(ProcessingOutcome::UnknownOrder);
            }
            Err(e) => return self.defer(channel, delivery, order_id, e).await,
        };

        match order.status {
            // A redelivered copy may be a give-up whose park never reached
            // the failed queue, so park it again
            OrderStatus::Failed if delivery.redelivered => {
                warn!("Order {} already FAILED, re-parking redelivered payload", order_id);
                self.route_to_failed(channel, delivery).await?;
                return Ok(ProcessingOutcome::AlreadyFailed);
            }
            OrderStatus::Failed => {
                debug!("Order {} already FAILED, acknowledging", order_id);
                channel.ack(delivery.delivery_tag).await?;
                return Ok(ProcessingOutcome::AlreadyFailed);
            }
            // COMPLETED without a ledger row cannot be produced by this
            // processor; never run the effect twice
            OrderStatus::Completed => {
                debug!("Order {} already COMPLETED, acknowledging", order_id);
                channel.ack(delivery.delivery_tag).await?;
                return Ok(ProcessingOutcome::Duplicate);
            }
            OrderStatus::Pending | OrderStatus::Processing => {}
        }

        let attempt = async {
            if !self.store.mark_processing(order_id).await? {
                return Err(OrderflowError::InvalidStateTransition {
                    from: order.status.to_string(),
                    to: OrderStatus::Processing.to_string(),
                });
            }
            self.effect.apply(&order).await?;
            self.store.complete_order(order_id).await
        };

        match attempt.await {
            Ok(true) => {
                channel.ack(delivery.delivery_tag).await?;
                info!("Order {} completed", order_id);
                Ok(ProcessingOutcome::Completed)
            }
            Ok(false) => {
                debug!("Order {} settled by another consumer, acknowledging", order_id);
                channel.ack(delivery.delivery_tag).await?;
                Ok(ProcessingOutcome::Duplicate)
            }
            Err(cause) => self.record_failure(channel, delivery, order_id, cause).await,
        }
    }

    /// Failure path: re-read the authoritative retry count, then retry or give
    /// up. Permanent errors give up without spending the remaining retries.
    async fn record_failure(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
        order_id: &str,
        cause: OrderflowError,
    ) -> Result<ProcessingOutcome> {
        loop {
            let order = match self.store.get_order(order_id).await {
                Ok(Some(order)) => order,
                Ok(None) => {
                    error!("Order {} vanished after failure: {}", order_id, cause);
                    self.route_to_failed(channel, delivery).await?;
                    return Ok(ProcessingOutcome::UnknownOrder);
                }
                Err(e) => return self.defer(channel, delivery, order_id, e).await,
            };

            // Another consumer settled it meanwhile
            match order.status {
                OrderStatus::Completed => {
                    channel.ack(delivery.delivery_tag).await?;
                    return Ok(ProcessingOutcome::Duplicate);
                }
                OrderStatus::Failed => {
                    channel.ack(delivery.delivery_tag).await?;
                    return Ok(ProcessingOutcome::AlreadyFailed);
                }
                OrderStatus::Pending | OrderStatus::Processing => {}
            }

            let decision = if cause.is_permanent() {
                RetryDecision::GiveUp
            } else {
                self.policy.decide(order.retry_count)
            };

            match decision {
                RetryDecision::Retry => {
                    match self.store.increment_retry(order_id, order.retry_count).await {
                        Ok(Some(retry_count)) => {
                            channel.reject(delivery.delivery_tag).await?;
                            warn!(
                                "Order {} failed ({}), retry {}/{}",
                                order_id, cause, retry_count, self.policy.max_retries
                            );
                            return Ok(ProcessingOutcome::Retried { retry_count });
                        }
                        Ok(None) => {
                            debug!("Retry count of {} moved, re-reading", order_id);
                            continue;
                        }
                        Err(e) => return self.defer(channel, delivery, order_id, e).await,
                    }
                }
                RetryDecision::GiveUp => {
                    if let Err(e) = self.store.mark_failed(order_id).await {
                        return self.defer(channel, delivery, order_id, e).await;
                    }
                    self.route_to_failed(channel, delivery).await?;
                    error!(
                        "Order {} failed after {} retries: {}",
                        order_id, order.retry_count, cause
                    );
                    return Ok(ProcessingOutcome::GaveUp {
                        retry_count: order.retry_count,
                    });
                }
            }
        }
    }

    /// Publish the original payload under the failed key, then ack it off the
    /// main queue. A plain reject would land it in the retry queue instead.
    async fn route_to_failed(&self, channel: &dyn BrokerChannel, delivery: &Delivery) -> Result<()> {
        channel
            .publish(
                &self.config.dead_letter_exchange,
                &self.config.failed_key,
                &delivery.payload,
            )
            .await?;
        channel.ack(delivery.delivery_tag).await
    }

    async fn defer(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
        order_id: &str,
        cause: OrderflowError,
    ) -> Result<ProcessingOutcome> {
        error!("Store unavailable for order {}: {}", order_id, cause);
        channel.reject(delivery.delivery_tag).await?;
        self.stats.write().await.last_error = Some(cause.to_string());
        Ok(ProcessingOutcome::Deferred)
    }
}
