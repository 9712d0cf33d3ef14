//! End-to-end pipeline behaviour against the in-memory store and broker.

use async_trait::async_trait;
use orderflow::adapters::{
    Binding, BrokerChannel, DeliveryStream, ExchangeSpec, InMemoryBroker, InMemoryStore,
    OrderStore, QueueSpec,
};
use orderflow::config::TopologyConfig;
use orderflow::domain::{NewOrder, Order, OrderMessage, OrderStatus};
use orderflow::error::{OrderflowError, Result};
use orderflow::pipeline::{
    MessageProcessor, OrderEffect, ProcessingOutcome, ProcessorConfig, TopologyManager,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts invocations and fails when told to
struct ScriptedEffect {
    calls: AtomicUsize,
    fail: bool,
}

impl ScriptedEffect {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderEffect for ScriptedEffect {
    async fn apply(&self, _order: &Order) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(OrderflowError::Effect("downstream rejected the order".into()))
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Broker channel whose next publish under one routing key fails
struct DroppedPublish {
    inner: InMemoryBroker,
    routing_key: String,
    failures_left: AtomicUsize,
}

#[async_trait]
impl BrokerChannel for DroppedPublish {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.inner.declare_exchange(exchange).await
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.inner.declare_queue(queue).await
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.inner.bind_queue(binding).await
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        if routing_key == self.routing_key
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(OrderflowError::BrokerUnavailable("publish not confirmed".into()));
        }
        self.inner.publish(exchange, routing_key, payload).await
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.inner.consume(queue, consumer_tag, prefetch).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner.ack(delivery_tag).await
    }

    async fn reject(&self, delivery_tag: u64) -> Result<()> {
        self.inner.reject(delivery_tag).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

struct Harness {
    store: InMemoryStore,
    broker: InMemoryBroker,
    topology: TopologyConfig,
    effect: Arc<ScriptedEffect>,
    processor: MessageProcessor,
}

impl Harness {
    async fn new(fail: bool) -> Self {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        let topology = TopologyConfig::default();
        TopologyManager::new(topology.clone(), 5000)
            .declare(&broker)
            .await
            .unwrap();

        let effect = ScriptedEffect::new(fail);
        let processor = MessageProcessor::new(
            ProcessorConfig::default(),
            Arc::new(store.clone()),
            effect.clone(),
        );

        Self {
            store,
            broker,
            topology,
            effect,
            processor,
        }
    }

    /// Persist as PENDING, then publish: the producer contract.
    async fn submit(&self, quantity: i32) -> Order {
        let order = NewOrder {
            user_id: "user-1".into(),
            product_id: "product-1".into(),
            quantity,
        }
        .into_order();
        self.store.insert_order(&order).await.unwrap();
        self.republish(&order).await;
        order
    }

    async fn republish(&self, order: &Order) {
        let payload = OrderMessage::from_order(order).to_bytes().unwrap();
        self.publish_raw(&payload).await;
    }

    async fn publish_raw(&self, payload: &[u8]) {
        self.broker
            .publish(&self.topology.exchange, &self.topology.submitted_key, payload)
            .await
            .unwrap();
    }

    async fn deliver_next(&self) -> ProcessingOutcome {
        let delivery = self
            .broker
            .get(&self.topology.queue)
            .await
            .expect("main queue should hold a delivery");
        self.processor.handle(&self.broker, delivery).await.unwrap()
    }

    async fn order(&self, order_id: &str) -> Order {
        self.store.get_order(order_id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn submitted_order_completes_and_duplicate_is_ignored() {
    let h = Harness::new(false).await;
    let o1 = h.submit(2).await;

    let stored = h.order(&o1.order_id).await;
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(stored.retry_count, 0);

    assert_eq!(h.deliver_next().await, ProcessingOutcome::Completed);
    assert_eq!(h.order(&o1.order_id).await.status, OrderStatus::Completed);
    assert!(h.store.is_processed(&o1.order_id).await.unwrap());

    // at-least-once duplicate
    h.republish(&o1).await;
    assert_eq!(h.deliver_next().await, ProcessingOutcome::Duplicate);
    assert_eq!(h.order(&o1.order_id).await.status, OrderStatus::Completed);
    assert_eq!(h.effect.calls(), 1);
    assert_eq!(h.broker.unacked_len().await, 0);
}

#[tokio::test]
async fn always_failing_order_is_parked_after_four_attempts() {
    let h = Harness::new(true).await;
    let o2 = h.submit(1).await;

    let mut attempts = 0;
    loop {
        attempts += 1;
        match h.deliver_next().await {
            ProcessingOutcome::Retried { retry_count } => {
                assert_eq!(retry_count, attempts);
                assert_eq!(h.broker.queue_len(&h.topology.retry_queue).await, 1);
                // TTL elapses, the broker routes it back to the main queue
                assert_eq!(h.broker.expire_now(&h.topology.retry_queue).await, 1);
            }
            ProcessingOutcome::GaveUp { retry_count } => {
                assert_eq!(retry_count, 3);
                break;
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(attempts, 4);
    let stored = h.order(&o2.order_id).await;
    assert_eq!(stored.status, OrderStatus::Failed);
    assert_eq!(stored.retry_count, 3);

    assert_eq!(h.broker.queue_len(&h.topology.queue).await, 0);
    assert_eq!(h.broker.queue_len(&h.topology.retry_queue).await, 0);
    let parked = h.broker.queue_payloads(&h.topology.failed_queue).await;
    assert_eq!(parked.len(), 1);
    assert_eq!(OrderMessage::parse(&parked[0]).unwrap().order_id, o2.order_id);
    assert!(!h.store.is_processed(&o2.order_id).await.unwrap());
}

#[tokio::test]
async fn give_up_survives_a_lost_failed_queue_publish() {
    let h = Harness::new(true).await;
    let o2 = h.submit(1).await;

    for _ in 0..3 {
        assert!(matches!(
            h.deliver_next().await,
            ProcessingOutcome::Retried { .. }
        ));
        h.broker.expire_now(&h.topology.retry_queue).await;
    }

    // The give-up marks FAILED, but parking the payload fails
    let flaky = DroppedPublish {
        inner: h.broker.clone(),
        routing_key: h.topology.failed_key.clone(),
        failures_left: AtomicUsize::new(1),
    };
    let delivery = h.broker.get(&h.topology.queue).await.unwrap();
    assert!(h.processor.handle(&flaky, delivery).await.is_err());
    assert_eq!(h.order(&o2.order_id).await.status, OrderStatus::Failed);
    assert_eq!(h.broker.queue_len(&h.topology.failed_queue).await, 0);

    // The undecided delivery comes back once the channel drops
    h.broker.disconnect().await;
    h.broker.reconnect();
    let redelivery = h.broker.get(&h.topology.queue).await.unwrap();
    assert!(redelivery.redelivered);
    assert_eq!(
        h.processor.handle(&h.broker, redelivery).await.unwrap(),
        ProcessingOutcome::AlreadyFailed
    );

    let parked = h.broker.queue_payloads(&h.topology.failed_queue).await;
    assert_eq!(parked.len(), 1);
    assert_eq!(OrderMessage::parse(&parked[0]).unwrap().order_id, o2.order_id);
    assert_eq!(h.broker.queue_len(&h.topology.queue).await, 0);
    assert_eq!(h.broker.queue_len(&h.topology.retry_queue).await, 0);
    assert_eq!(h.broker.unacked_len().await, 0);
    assert_eq!(h.order(&o2.order_id).await.retry_count, 3);
}

#[tokio::test]
async fn repeated_deliveries_produce_one_ledger_entry() {
    let h = Harness::new(false).await;
    let order = h.submit(3).await;
    for _ in 0..4 {
        h.republish(&order).await;
    }

    let mut completed = 0;
    for _ in 0..5 {
        if h.deliver_next().await == ProcessingOutcome::Completed {
            completed += 1;
        }
    }

    assert_eq!(completed, 1);
    assert_eq!(h.effect.calls(), 1);
    assert_eq!(h.store.ledger_len().await, 1);
}

#[tokio::test]
async fn retry_count_and_status_never_go_backwards() {
    let h = Harness::new(true).await;
    let order = h.submit(1).await;

    let mut last_count = 0;
    for _ in 0..4 {
        h.deliver_next().await;
        let stored = h.order(&order.order_id).await;
        assert!(stored.retry_count >= last_count);
        last_count = stored.retry_count;
        h.broker.expire_now(&h.topology.retry_queue).await;
    }

    // A stale copy of a FAILED order is acked without running the effect
    let calls = h.effect.calls();
    h.republish(&order).await;
    assert_eq!(h.deliver_next().await, ProcessingOutcome::AlreadyFailed);
    assert_eq!(h.effect.calls(), calls);

    let stored = h.order(&order.order_id).await;
    assert_eq!(stored.status, OrderStatus::Failed);
    assert_eq!(stored.retry_count, 3);
}

#[tokio::test]
async fn malformed_delivery_skips_store_and_retry_budget() {
    let h = Harness::new(false).await;
    h.store.set_unavailable(true);

    let payloads: [&[u8]; 3] = [b"{not json", br#"{"userId":"u1"}"#, br#"{"orderId":""}"#];
    for payload in payloads {
        h.publish_raw(payload).await;
        assert_eq!(h.deliver_next().await, ProcessingOutcome::Malformed);
    }

    assert_eq!(h.broker.queue_len(&h.topology.failed_queue).await, 3);
    assert_eq!(h.broker.queue_len(&h.topology.retry_queue).await, 0);
    assert_eq!(h.effect.calls(), 0);
    assert_eq!(h.processor.stats().await.malformed, 3);
}

#[tokio::test]
async fn concurrent_deliveries_for_one_order_run_the_effect_once() {
    let h = Harness::new(false).await;
    let order = h.submit(1).await;
    h.republish(&order).await;

    let first = h.broker.get(&h.topology.queue).await.unwrap();
    let second = h.broker.get(&h.topology.queue).await.unwrap();

    let (a, b) = tokio::join!(
        h.processor.handle(&h.broker, first),
        h.processor.handle(&h.broker, second)
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| format!("{o:?}"));

    assert_eq!(
        outcomes,
        vec![ProcessingOutcome::Completed, ProcessingOutcome::Duplicate]
    );
    assert_eq!(h.effect.calls(), 1);
    assert_eq!(h.store.ledger_len().await, 1);
}

#[tokio::test]
async fn two_consumers_share_one_ledger() {
    let h = Harness::new(false).await;
    let other = MessageProcessor::new(
        ProcessorConfig::default(),
        Arc::new(h.store.clone()),
        ScriptedEffect::new(false),
    );
    let order = h.submit(1).await;
    h.republish(&order).await;

    let first = h.broker.get(&h.topology.queue).await.unwrap();
    let second = h.broker.get(&h.topology.queue).await.unwrap();

    let (a, b) = tokio::join!(
        h.processor.handle(&h.broker, first),
        other.handle(&h.broker, second)
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == ProcessingOutcome::Completed)
            .count(),
        1
    );
    assert_eq!(h.store.ledger_len().await, 1);
    assert_eq!(h.order(&order.order_id).await.status, OrderStatus::Completed);
}

#[tokio::test]
async fn topology_can_be_declared_repeatedly() {
    let broker = InMemoryBroker::new();
    let manager = TopologyManager::new(TopologyConfig::default(), 5000);

    for _ in 0..3 {
        manager.declare(&broker).await.unwrap();
    }

    assert_eq!(broker.topology_counts().await, (2, 3, 3));
    let retry = broker.queue_spec("order_retry_queue").await.unwrap();
    assert_eq!(retry.message_ttl_ms, Some(5000));
    assert_eq!(retry.dead_letter_exchange.as_deref(), Some("order_exchange"));
}
