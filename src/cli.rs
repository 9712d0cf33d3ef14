use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::{InMemoryBroker, InMemoryConnector, InMemoryStore, OrderStore};
use crate::config::AppConfig;
use crate::coordination::{ConnectionEvent, ConnectionSupervisor, GracefulShutdown, ShutdownSignal};
use crate::domain::{NewOrder, Order};
use crate::error::{OrderflowError, Result};
use crate::pipeline::{
    MessageProcessor, OrderProducer, ProcessorConfig, ProcessorStats, SimulatedFailureEffect,
    TopologyManager,
};

#[derive(Parser)]
#[command(name = "orderflow")]
#[command(author = "Orderflow Team")]
#[command(version = "0.1.0")]
#[command(about = "Order processing pipeline with broker-driven retries", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml, <ORDERFLOW_ENV>.toml)
    #[arg(short, long, default_value = "config", global = true)]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervised consumer
    Consume {
        /// Serve health and metrics on this port
        #[arg(long)]
        health_port: Option<u16>,
    },
    /// Run the ingress API
    Serve {
        /// Listen address, overrides api.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Declare the broker topology and exit
    Topology,
    /// Show an order from the store
    Status {
        /// Order ID
        order_id: String,
    },
    /// Persist and publish one order
    Submit {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        product_id: String,
        #[arg(long)]
        quantity: i32,
    },
    /// Run the whole pipeline in-process on in-memory adapters
    Demo {
        /// Retry queue TTL for the demo
        #[arg(long, default_value = "200")]
        retry_ttl_ms: u32,
        /// Retries before giving up
        #[arg(long, default_value = "3")]
        max_retries: i32,
    },
}

/// Print an order in a human-readable form
pub fn print_order(order: &Order) {
    println!("Order {}", order.order_id);
    println!("  user:        {}", order.user_id);
    println!("  product:     {}", order.product_id);
    println!("  quantity:    {}", order.quantity);
    println!("  status:      {}", order.status);
    println!("  retry count: {}", order.retry_count);
    println!("  created at:  {}", order.created_at.to_rfc3339());
}

/// Outcome of [`run_demo`]
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub orders: Vec<Order>,
    pub failed_queue_len: usize,
    pub stats: ProcessorStats,
}

/// Quantity the demo's effect always fails on
pub const DEMO_FAILING_QUANTITY: i32 = 999;

/// Submit one order that succeeds and one that always fails through the full
/// supervised pipeline, and wait until both are terminal.
pub async fn run_demo(config: &AppConfig, retry_ttl_ms: u32, max_retries: i32) -> Result<DemoReport> {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let topology = TopologyManager::new(config.topology.clone(), retry_ttl_ms);

    let processor = Arc::new(MessageProcessor::new(
        ProcessorConfig {
            max_retries,
            ..ProcessorConfig::from_app(config)
        },
        Arc::new(store.clone()),
        Arc::new(SimulatedFailureEffect::new(DEMO_FAILING_QUANTITY)),
    ));
    let supervisor = Arc::new(ConnectionSupervisor::new(
        Arc::new(InMemoryConnector::new(broker.clone())),
        topology,
        Duration::from_millis(100),
    ));
    let producer = OrderProducer::new(
        Arc::new(store.clone()),
        supervisor.channel_slot(),
        &config.topology,
    );

    let shutdown = GracefulShutdown::default();
    let mut events = supervisor.subscribe();
    let handle = {
        let supervisor = supervisor.clone();
        let processor = processor.clone();
        let listener = shutdown.listener();
        tokio::spawn(async move { supervisor.run(Some(processor), listener).await })
    };

    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Connected { .. }) => break,
            Ok(_) => continue,
            Err(e) => return Err(OrderflowError::Internal(format!("supervisor stopped: {e}"))),
        }
    }

    let mut ids = Vec::new();
    for quantity in [2, DEMO_FAILING_QUANTITY] {
        let submitted = producer
            .submit(NewOrder {
                user_id: "demo-user".to_string(),
                product_id: "demo-product".to_string(),
                quantity,
            })
            .await?;
        ids.push(submitted.order.order_id);
    }

    let budget = u64::from(retry_ttl_ms) * u64::try_from(max_retries.max(0) + 2).unwrap_or(5);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(budget + 5_000);
    let orders = loop {
        let mut orders = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(order) = store.get_order(id).await? {
                orders.push(order);
            }
        }
        if orders.len() == ids.len() && orders.iter().all(|o| o.status.is_terminal()) {
            break orders;
        }
        if tokio::time::Instant::now() >= deadline {
            shutdown.request_shutdown(ShutdownSignal::Graceful);
            return Err(OrderflowError::Internal(
                "demo orders did not settle in time".to_string(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    shutdown.request_shutdown(ShutdownSignal::Graceful);
    handle
        .await
        .map_err(|e| OrderflowError::Internal(format!("supervisor task failed: {e}")))??;

    Ok(DemoReport {
        orders,
        failed_queue_len: broker.queue_len(&config.topology.failed_queue).await,
        stats: processor.stats().await,
    })
}
