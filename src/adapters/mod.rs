pub mod memory;
pub mod postgres;
pub mod rabbitmq;
pub mod traits;

pub use memory::{InMemoryBroker, InMemoryConnector, InMemoryStore};
pub use postgres::PostgresStore;
pub use rabbitmq::{RabbitChannel, RabbitConnector};
pub use traits::{
    Binding, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, ExchangeKind,
    ExchangeSpec, OrderStore, QueueSpec,
};
