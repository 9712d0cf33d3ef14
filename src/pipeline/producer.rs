//! Order producer: persist first, then publish.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::adapters::traits::OrderStore;
use crate::config::TopologyConfig;
use crate::coordination::supervisor::ChannelSlot;
use crate::domain::{NewOrder, Order, OrderMessage};
use crate::error::Result;

/// A persisted order and whether it reached the broker
#[derive(Debug, Clone)]
pub struct SubmittedOrder {
    pub order: Order,
    pub published: bool,
}

pub struct OrderProducer {
    store: Arc<dyn OrderStore>,
    channel: ChannelSlot,
    exchange: String,
    routing_key: String,
}

impl OrderProducer {
    pub fn new(store: Arc<dyn OrderStore>, channel: ChannelSlot, topology: &TopologyConfig) -> Self {
        Self {
            store,
            channel,
            exchange: topology.exchange.clone(),
            routing_key: topology.submitted_key.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// Validate, persist as PENDING and publish under the submitted key.
    ///
    /// The order is durable before anything is published. A missing or
    /// failing broker channel is logged and reported through
    /// [`SubmittedOrder::published`]; the order then stays PENDING.
    pub async fn submit(&self, new_order: NewOrder) -> Result<SubmittedOrder> {
        new_order.validate()?;

        let order = new_order.into_order();
        self.store.insert_order(&order).await?;

        let payload = OrderMessage::from_order(&order).to_bytes()?;
        let channel = self.channel.read().await.clone();

        let published = match channel {
            Some(channel) if channel.is_connected() => {
                match channel
                    .publish(&self.exchange, &self.routing_key, &payload)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Failed to publish order {}: {}", order.order_id, e);
                        false
                    }
                }
            }
            _ => {
                warn!("Broker unavailable, order {} left PENDING", order.order_id);
                false
            }
        };

        if published {
            info!("Order {} submitted", order.order_id);
        }
        Ok(SubmittedOrder { order, published })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryBroker, InMemoryStore};
    use crate::adapters::traits::BrokerChannel;
    use crate::domain::OrderStatus;
    use crate::error::OrderflowError;
    use crate::pipeline::topology::TopologyManager;
    use tokio::sync::RwLock;

    fn new_order(quantity: i32) -> NewOrder {
        NewOrder {
            user_id: "u1".into(),
            product_id: "p1".into(),
            quantity,
        }
    }

    async fn producer(connected: bool) -> (OrderProducer, InMemoryStore, InMemoryBroker) {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        let topology = TopologyConfig::default();
        TopologyManager::new(topology.clone(), 5000)
            .declare(&broker)
            .await
            .unwrap();

        let channel: Option<Arc<dyn BrokerChannel>> = if connected {
            Some(Arc::new(broker.clone()))
        } else {
            None
        };
        let producer = OrderProducer::new(
            Arc::new(store.clone()),
            Arc::new(RwLock::new(channel)),
            &topology,
        );
        (producer, store, broker)
    }

    #[tokio::test]
    async fn test_submit_persists_then_publishes() {
        let (producer, store, broker) = producer(true).await;
        let submitted = producer.submit(new_order(2)).await.unwrap();

        assert!(submitted.published);
        let stored = store
            .get_order(&submitted.order.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.retry_count, 0);

        let payloads = broker.queue_payloads("order_processing_queue").await;
        let message = OrderMessage::parse(&payloads[0]).unwrap();
        assert_eq!(message.order_id, submitted.order.order_id);
    }

    #[tokio::test]
    async fn test_submit_without_broker_still_persists() {
        let (producer, store, _broker) = producer(false).await;
        let submitted = producer.submit(new_order(2)).await.unwrap();

        assert!(!submitted.published);
        assert!(store
            .get_order(&submitted.order.order_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_invalid_order_is_rejected_before_publish() {
        let (producer, _store, broker) = producer(true).await;
        let err = producer.submit(new_order(0)).await.unwrap_err();

        assert!(matches!(err, OrderflowError::Validation(_)));
        assert_eq!(broker.queue_len("order_processing_queue").await, 0);
    }
}
