use clap::Parser;
use orderflow::adapters::{OrderStore, PostgresStore};
use orderflow::cli::{self, Cli, Commands};
use orderflow::config::AppConfig;
use orderflow::domain::NewOrder;
use orderflow::error::OrderflowError;
use tracing::info;

mod main_runtime;

use main_runtime::{
    declare_topology, init_logging, init_logging_simple, run_api, run_consumer, submit_once,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config: {e}");
        }
        anyhow::bail!("invalid configuration ({} errors)", errors.len());
    }

    match cli.command {
        Commands::Consume { health_port } => {
            init_logging(&config.logging);
            if health_port.is_some() {
                config.health_port = health_port;
            }
            info!(
                "Starting consumer (max retries {}, retry ttl {}ms)",
                config.retry.max_retries, config.retry.ttl_ms
            );
            run_consumer(config).await?;
        }
        Commands::Serve { bind } => {
            init_logging(&config.logging);
            run_api(config, bind).await?;
        }
        Commands::Topology => {
            init_logging_simple();
            declare_topology(&config).await?;
            println!("Topology declared on {}", config.topology.exchange);
        }
        Commands::Status { order_id } => {
            init_logging_simple();
            let store =
                PostgresStore::new(&config.database.url, config.database.max_connections).await?;
            match store.get_order(&order_id).await? {
                Some(order) => cli::print_order(&order),
                None => return Err(OrderflowError::OrderNotFound(order_id).into()),
            }
        }
        Commands::Submit {
            user_id,
            product_id,
            quantity,
        } => {
            init_logging_simple();
            let submitted = submit_once(
                &config,
                NewOrder {
                    user_id,
                    product_id,
                    quantity,
                },
            )
            .await?;
            cli::print_order(&submitted.order);
            if !submitted.published {
                println!("Warning: order persisted but not published");
            }
        }
        Commands::Demo {
            retry_ttl_ms,
            max_retries,
        } => {
            init_logging(&config.logging);
            let report = cli::run_demo(&config, retry_ttl_ms, max_retries).await?;
            for order in &report.orders {
                cli::print_order(order);
            }
            println!(
                "Failed queue: {} message(s); {} deliveries, {} retried",
                report.failed_queue_len, report.stats.received, report.stats.retried
            );
        }
    }

    Ok(())
}
