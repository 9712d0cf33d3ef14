//! Broker routing graph
//!
//! ```text
//!  producer --order.submitted--> [order_exchange] --order.submitted--> order_processing_queue
//!                                       ^                                   | reject (no requeue)
//!                                       | TTL expiry                        v
//!                              order_retry_queue <--order.retry-- [order_dlx]
//!                                                                     |
//!                                    order_failed_queue <--order.failed
//! ```
//!
//! Delayed retry is a property of the graph: a rejected delivery sits in the
//! retry queue until its TTL expires and is then dead-lettered back to the
//! main exchange. Nothing is scheduled in process memory.

use tracing::info;

use crate::adapters::traits::{Binding, BrokerChannel, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::config::TopologyConfig;
use crate::error::Result;

/// Declares the routing graph; safe to run on every (re)connect
#[derive(Debug, Clone)]
pub struct TopologyManager {
    config: TopologyConfig,
    retry_ttl_ms: u32,
}

impl TopologyManager {
    pub fn new(config: TopologyConfig, retry_ttl_ms: u32) -> Self {
        Self {
            config,
            retry_ttl_ms,
        }
    }

    pub fn exchanges(&self) -> Vec<ExchangeSpec> {
        [&self.config.exchange, &self.config.dead_letter_exchange]
            .into_iter()
            .map(|name| ExchangeSpec {
                name: name.clone(),
                kind: ExchangeKind::Direct,
                durable: true,
            })
            .collect()
    }

    pub fn queues(&self) -> Vec<QueueSpec> {
        let c = &self.config;
        vec![
            // Rejections leave through the DLX towards the retry queue
            QueueSpec {
                name: c.queue.clone(),
                durable: true,
                dead_letter_exchange: Some(c.dead_letter_exchange.clone()),
                dead_letter_routing_key: Some(c.retry_key.clone()),
                message_ttl_ms: None,
            },
            // Expiry sends the message back to the main exchange
            QueueSpec {
                name: c.retry_queue.clone(),
                durable: true,
                dead_letter_exchange: Some(c.exchange.clone()),
                dead_letter_routing_key: Some(c.submitted_key.clone()),
                message_ttl_ms: Some(self.retry_ttl_ms),
            },
            // Parked for operators; never consumed here
            QueueSpec {
                name: c.failed_queue.clone(),
                durable: true,
                dead_letter_exchange: None,
                dead_letter_routing_key: None,
                message_ttl_ms: None,
            },
        ]
    }

    pub fn bindings(&self) -> Vec<Binding> {
        let c = &self.config;
        let bind = |queue: &str, exchange: &str, routing_key: &str| Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };

        vec![
            bind(&c.queue, &c.exchange, &c.submitted_key),
            bind(&c.retry_queue, &c.dead_letter_exchange, &c.retry_key),
            bind(&c.failed_queue, &c.dead_letter_exchange, &c.failed_key),
        ]
    }

    /// Declare exchanges, then queues, then bindings.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()> {
        for exchange in self.exchanges() {
            channel.declare_exchange(&exchange).await?;
        }
        for queue in self.queues() {
            channel.declare_queue(&queue).await?;
        }
        for binding in self.bindings() {
            channel.bind_queue(&binding).await?;
        }

        info!(
            "Broker topology ready ({} -> {}, retry ttl {}ms)",
            self.config.exchange, self.config.queue, self.retry_ttl_ms
        );
        Ok(())
    }
}
