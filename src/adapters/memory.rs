//! In-process store and broker
//!
//! Both doubles keep the semantics the pipeline relies on: the store enforces
//! ledger uniqueness and forward-only status updates, and the broker routes by
//! exchange binding, dead-letters rejected messages through the queue's DLX
//! arguments and expires messages from TTL queues. Used by the test-suite and
//! by the `demo` command.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::adapters::traits::{
    Binding, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, ExchangeSpec,
    OrderStore, QueueSpec,
};
use crate::domain::{Order, OrderStatus};
use crate::error::{OrderflowError, Result};

// ==================== Store ====================

#[derive(Default)]
struct StoreState {
    orders: HashMap<String, Order>,
    ledger: HashSet<String>,
}

/// In-memory order store
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the pool timed out.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(OrderflowError::Database(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }

    pub async fn ledger_len(&self) -> usize {
        self.state.lock().await.ledger.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.order_id) {
            return Err(OrderflowError::Internal(format!(
                "duplicate order id {}",
                order.order_id
            )));
        }
        state.orders.insert(order.order_id.clone(), order.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<Order>> {
        self.check_available()?;
        Ok(self.state.lock().await.orders.get(order_id).cloned())
    }

    async fn is_processed(&self, order_id: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.lock().await.ledger.contains(order_id))
    }

    async fn mark_processing(&self, order_id: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.orders.get_mut(order_id) {
            Some(order) if order.status.can_transition_to(OrderStatus::Processing) => {
                order.status = OrderStatus::Processing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_order(&self, order_id: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.ledger.contains(order_id) {
            return Ok(false);
        }
        match state.orders.get_mut(order_id) {
            Some(order) if order.status.can_transition_to(OrderStatus::Completed) => {
                order.status = OrderStatus::Completed;
            }
            _ => return Ok(false),
        }
        state.ledger.insert(order_id.to_string());
        Ok(true)
    }

    async fn increment_retry(&self, order_id: &str, expected: i32) -> Result<Option<i32>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.orders.get_mut(order_id) {
            Some(order) if order.retry_count == expected => {
                order.retry_count += 1;
                Ok(Some(order.retry_count))
            }
            _ => Ok(None),
        }
    }

    async fn mark_failed(&self, order_id: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.orders.get_mut(order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Failed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

// ==================== Broker ====================

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    routing_key: String,
    redelivered: bool,
    enqueued_at: Instant,
}

struct MemoryQueue {
    spec: QueueSpec,
    messages: VecDeque<Message>,
}

struct Unacked {
    queue: String,
    message: Message,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
}

impl BrokerState {
    /// Deliver to every queue bound under `routing_key`. Returns the TTL
    /// queues that received a copy, so the caller can schedule expiry.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Vec<(String, Duration)> {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();

        if targets.is_empty() {
            debug!("Unroutable message dropped ({} / {})", exchange, routing_key);
        }

        let mut ttl_queues = Vec::new();
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.messages.push_back(Message {
                    payload: payload.to_vec(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    enqueued_at: Instant::now(),
                });
                if let Some(ttl) = queue.spec.message_ttl_ms {
                    ttl_queues.push((name, Duration::from_millis(u64::from(ttl))));
                }
            }
        }
        ttl_queues
    }

    /// Forward a message leaving `queue` through its dead-letter arguments.
    fn dead_letter(&mut self, queue: &str, message: &Message) -> Vec<(String, Duration)> {
        let Some(spec) = self.queues.get(queue).map(|q| q.spec.clone()) else {
            return Vec::new();
        };
        let Some(dlx) = spec.dead_letter_exchange else {
            debug!("Message dropped from {} (no dead-letter exchange)", queue);
            return Vec::new();
        };
        let routing_key = spec
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        self.route(&dlx, &routing_key, &message.payload)
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    changes: watch::Sender<u64>,
    connected: AtomicBool,
    refuse_connects: AtomicU32,
    connects: AtomicU32,
}

/// In-memory broker with direct exchanges, dead-lettering and TTL expiry
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
        let (changes, _) = watch::channel(0u64);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                changes,
                connected: AtomicBool::new(true),
                refuse_connects: AtomicU32::new(0),
                connects: AtomicU32::new(0),
            }),
        }
    }

    fn notify(&self) {
        self.shared
            .changes
            .send_modify(|version| *version = version.wrapping_add(1));
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrderflowError::BrokerUnavailable("channel closed".to_string()))
        }
    }

    fn schedule_expiry(&self, ttl_queues: Vec<(String, Duration)>) {
        for (queue, ttl) in ttl_queues {
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                broker.expire_due(&queue).await;
            });
        }
    }

    async fn take_next(&self, queue: &str) -> Option<Delivery> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return None;
        }
        let mut state = self.state().await;
        let message = state.queues.get_mut(queue)?.messages.pop_front()?;
        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        let delivery = Delivery {
            delivery_tag,
            payload: message.payload.clone(),
            redelivered: message.redelivered,
        };
        state.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue.to_string(),
                message,
            },
        );
        Some(delivery)
    }

    async fn state(&self) -> tokio::sync::MutexGuard<'_, BrokerState> {
        self.shared.state.lock().await
    }

    /// Dead-letter every message whose TTL has elapsed.
    pub async fn expire_due(&self, queue: &str) -> usize {
        self.expire(queue, false).await
    }

    /// Dead-letter every message in a TTL queue as if its TTL had elapsed.
    pub async fn expire_now(&self, queue: &str) -> usize {
        self.expire(queue, true).await
    }

    async fn expire(&self, queue: &str, force: bool) -> usize {
        let mut scheduled = Vec::new();
        let expired = {
            let mut state = self.state().await;
            let Some(q) = state.queues.get_mut(queue) else {
                return 0;
            };
            let Some(ttl) = q.spec.message_ttl_ms else {
                return 0;
            };
            let ttl = Duration::from_millis(u64::from(ttl));

            let mut expired = Vec::new();
            while let Some(front) = q.messages.front() {
                if !force && front.enqueued_at.elapsed() < ttl {
                    break;
                }
                if let Some(message) = q.messages.pop_front() {
                    expired.push(message);
                }
            }
            for message in &expired {
                scheduled.extend(state.dead_letter(queue, message));
            }
            expired.len()
        };

        if expired > 0 {
            debug!("Expired {} message(s) from {}", expired, queue);
            self.schedule_expiry(scheduled);
            self.notify();
        }
        expired
    }

    /// Pull one message (basic.get). It must be acked or rejected like a
    /// consumed delivery.
    pub async fn get(&self, queue: &str) -> Option<Delivery> {
        self.take_next(queue).await
    }

    pub async fn queue_len(&self, queue: &str) -> usize {
        self.state()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub async fn queue_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn unacked_len(&self) -> usize {
        self.state().await.unacked.len()
    }

    /// (exchanges, queues, bindings) currently declared
    pub async fn topology_counts(&self) -> (usize, usize, usize) {
        let state = self.state().await;
        (
            state.exchanges.len(),
            state.queues.len(),
            state.bindings.len(),
        )
    }

    pub async fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.state().await.queues.get(queue).map(|q| q.spec.clone())
    }

    /// Drop the connection. Unacked messages go back to the head of their
    /// queues flagged as redelivered, and open consumer streams end.
    pub async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        {
            let mut state = self.state().await;
            let mut unacked: Vec<(u64, Unacked)> = state.unacked.drain().collect();
            unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, entry) in unacked {
                if let Some(queue) = state.queues.get_mut(&entry.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.messages.push_front(message);
                }
            }
        }
        self.notify();
    }

    pub fn reconnect(&self) {
        self.shared.connected.store(true, Ordering::SeqCst);
    }

    /// Refuse the next `count` connection attempts made through
    /// [`InMemoryConnector`].
    pub fn refuse_next_connects(&self, count: u32) {
        self.shared.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Successful connections made through [`InMemoryConnector`]
    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state().await;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(OrderflowError::Topology(format!(
                "exchange {} redeclared with different properties",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state().await;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => Err(OrderflowError::Topology(format!(
                "queue {} redeclared with different arguments",
                queue.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    MemoryQueue {
                        spec: queue.clone(),
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state().await;
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(OrderflowError::Topology(format!(
                "no exchange '{}'",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(OrderflowError::Topology(format!(
                "no queue '{}'",
                binding.queue
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        let scheduled = {
            let mut state = self.state().await;
            if !state.exchanges.contains_key(exchange) {
                return Err(OrderflowError::Topology(format!("no exchange '{exchange}'")));
            }
            state.route(exchange, routing_key, payload)
        };
        self.schedule_expiry(scheduled);
        self.notify();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_connected()?;
        if !self.state().await.queues.contains_key(queue) {
            return Err(OrderflowError::Topology(format!("no queue '{queue}'")));
        }

        let changes = self.shared.changes.subscribe();
        let seed = (self.clone(), queue.to_string(), changes);

        Ok(
            futures::stream::unfold(seed, |(broker, queue, mut changes)| async move {
                loop {
                    if let Some(delivery) = broker.take_next(&queue).await {
                        return Some((Ok(delivery), (broker, queue, changes)));
                    }
                    if !broker.shared.connected.load(Ordering::SeqCst) {
                        return None;
                    }
                    if changes.changed().await.is_err() {
                        return None;
                    }
                }
            })
            .boxed(),
        )
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_connected()?;
        self.state()
            .await
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| {
                OrderflowError::Internal(format!("unknown delivery tag {delivery_tag}"))
            })
    }

    async fn reject(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_connected()?;
        let scheduled = {
            let mut state = self.state().await;
            let entry = state.unacked.remove(&delivery_tag).ok_or_else(|| {
                OrderflowError::Internal(format!("unknown delivery tag {delivery_tag}"))
            })?;
            state.dead_letter(&entry.queue, &entry.message)
        };
        self.schedule_expiry(scheduled);
        self.notify();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

/// Hands out the shared [`InMemoryBroker`] as a fresh channel
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let refused = self
            .broker
            .shared
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(OrderflowError::BrokerUnavailable(
                "connection refused".to_string(),
            ));
        }

        self.broker.reconnect();
        self.broker.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.broker.clone()))
    }
}
