//! Seams between the pipeline and its infrastructure.
//!
//! The processor, topology manager and producer only ever see these traits;
//! PostgreSQL/RabbitMQ and the in-memory doubles sit behind them.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::domain::Order;
use crate::error::Result;

/// Durable store for orders and the processed-event ledger
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist a freshly submitted order.
    async fn insert_order(&self, order: &Order) -> Result<()>;

    /// Read the authoritative record.
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>>;

    /// Whether the ledger already holds this identifier.
    async fn is_processed(&self, order_id: &str) -> Result<bool>;

    /// Move a PENDING or PROCESSING order to PROCESSING.
    ///
    /// Returns `false` if the order is missing or already terminal.
    async fn mark_processing(&self, order_id: &str) -> Result<bool>;

    /// Mark COMPLETED and insert the ledger row as one commit.
    ///
    /// Returns `false` when the ledger row already existed or the order is
    /// no longer PROCESSING; in that case nothing is written.
    async fn complete_order(&self, order_id: &str) -> Result<bool>;

    /// Compare-and-set increment of `retry_count`.
    ///
    /// Returns the new count when the stored count equalled `expected`,
    /// `None` when it did not (or the order is gone).
    async fn increment_retry(&self, order_id: &str, expected: i32) -> Result<Option<i32>>;

    /// Move a non-terminal order to FAILED. Returns whether a row changed.
    async fn mark_failed(&self, order_id: &str) -> Result<bool>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<()>;
}

/// Exchange routing type. Only direct routing is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
    /// `x-message-ttl`
    pub message_ttl_ms: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// One delivery attempt handed to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A single broker channel. Publishes, acks and rejects are serialized
/// through it.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, binding: &Binding) -> Result<()>;

    /// Publish a persistent message.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Start consuming. The stream ends when the channel goes away.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16)
        -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject without requeue, handing the message to the queue's
    /// dead-letter route.
    async fn reject(&self, delivery_tag: u64) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Opens broker channels; called again after every disconnect.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>>;
}
