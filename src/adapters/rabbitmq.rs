//! RabbitMQ adapter (AMQP 0-9-1 via lapin)

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, info};

use crate::adapters::traits::{
    Binding, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, ExchangeKind,
    ExchangeSpec, QueueSpec,
};
use crate::error::{OrderflowError, Result};

/// Persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Opens one connection plus one channel per `connect` call
pub struct RabbitConnector {
    url: String,
}

impl RabbitConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerConnector for RabbitConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        info!("Connected to RabbitMQ (channel {})", channel.id());

        Ok(Arc::new(RabbitChannel {
            connection,
            channel,
        }))
    }
}

/// A lapin channel together with the connection that owns it
pub struct RabbitChannel {
    connection: Connection,
    channel: Channel,
}

impl RabbitChannel {
    fn queue_arguments(queue: &QueueSpec) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(dlx) = &queue.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }
        if let Some(key) = &queue.dead_letter_routing_key {
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }
        if let Some(ttl) = queue.message_ttl_ms {
            args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
        }
        args
    }
}

#[async_trait]
impl BrokerChannel for RabbitChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        let kind = match exchange.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };

        self.channel
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!("Declared exchange {}", exchange.name);
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                Self::queue_arguments(queue),
            )
            .await?;

        debug!("Declared queue {}", queue.name);
        Ok(())
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(
            "Bound {} to {} ({})",
            binding.queue, binding.exchange, binding.routing_key
        );
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_content_type("application/json".into());

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!("Consuming from {} (prefetch {})", queue, prefetch);

        Ok(consumer
            .map(|item| {
                item.map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    payload: delivery.data,
                    redelivered: delivery.redelivered,
                })
                .map_err(OrderflowError::from)
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn test_retry_queue_arguments() {
        let spec = QueueSpec {
            name: "order_retry_queue".into(),
            durable: true,
            dead_letter_exchange: Some("order_exchange".into()),
            dead_letter_routing_key: Some("order.submitted".into()),
            message_ttl_ms: Some(5000),
        };

        let args = RabbitChannel::queue_arguments(&spec);
        let inner = args.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-exchange")),
            Some(&AMQPValue::LongString("order_exchange".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-routing-key")),
            Some(&AMQPValue::LongString("order.submitted".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongUInt(5000))
        );
    }

    #[test]
    fn test_plain_queue_has_no_arguments() {
        let spec = QueueSpec {
            name: "order_failed_queue".into(),
            durable: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl_ms: None,
        };

        assert!(RabbitChannel::queue_arguments(&spec).inner().is_empty());
    }
}
