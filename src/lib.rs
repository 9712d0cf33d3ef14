pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod pipeline;
pub mod services;

pub use adapters::{
    BrokerChannel, BrokerConnector, InMemoryBroker, InMemoryConnector, InMemoryStore, OrderStore,
    PostgresStore, RabbitConnector,
};
pub use config::AppConfig;
pub use coordination::{
    ConnectionEvent, ConnectionSupervisor, GracefulShutdown, ShutdownListener, ShutdownSignal,
};
pub use domain::{NewOrder, Order, OrderMessage, OrderStatus};
pub use error::{OrderflowError, Result};
pub use pipeline::{
    MessageProcessor, OrderProducer, ProcessingOutcome, ProcessorConfig, RetryDecision,
    RetryPolicy, TopologyManager,
};
