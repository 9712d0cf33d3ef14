use orderflow::adapters::{BrokerConnector, OrderStore, PostgresStore, RabbitConnector};
use orderflow::api::{create_router, AppState};
use orderflow::config::{AppConfig, LoggingConfig};
use orderflow::coordination::{
    install_signal_handlers, retry_forever, ConnectionSupervisor, GracefulShutdown,
    ShutdownListener,
};
use orderflow::domain::NewOrder;
use orderflow::error::{OrderflowError, Result};
use orderflow::pipeline::{
    effect_from_config, MessageProcessor, OrderProducer, ProcessorConfig, SubmittedOrder,
    TopologyManager,
};
use orderflow::services::{HealthServer, HealthState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},orderflow=debug,sqlx=warn,lapin=warn",
            config.level
        ))
    });

    // `tracing_appender::rolling::daily` aborts the process if it cannot
    // create the initial file, so preflight writability.
    let file_layer = config.dir.as_deref().and_then(|log_dir| {
        if std::fs::create_dir_all(log_dir).is_err() {
            eprintln!(
                "Warning: Could not create log directory {}, file logging disabled",
                log_dir
            );
            return None;
        }
        let test_path = std::path::Path::new(log_dir).join(".orderflow_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(log_dir, "orderflow.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Lives as long as the process
                Box::leak(Box::new(guard));

                eprintln!("Logging to: {}/orderflow.log", log_dir);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    });

    let (json_layer, text_layer) = if config.json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();
}

pub fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn reconnect_delay(config: &AppConfig) -> Duration {
    config.supervisor.reconnect_delay()
}

/// Connect to PostgreSQL and apply migrations, retrying until it works.
pub async fn connect_store(
    config: &AppConfig,
    shutdown: &mut ShutdownListener,
) -> Result<Arc<PostgresStore>> {
    let url = config.database.url.clone();
    let max_connections = config.database.max_connections;

    let store = retry_forever(
        "Database connection",
        reconnect_delay(config),
        shutdown,
        || {
            let url = url.clone();
            async move {
                let store = PostgresStore::new(&url, max_connections).await?;
                store.migrate().await?;
                Ok(store)
            }
        },
    )
    .await
    .ok_or(OrderflowError::Cancelled)?;

    info!("Connected to PostgreSQL");
    Ok(Arc::new(store))
}

fn supervisor_for(config: &AppConfig) -> ConnectionSupervisor {
    ConnectionSupervisor::new(
        Arc::new(RabbitConnector::new(config.broker.url.clone())),
        TopologyManager::new(config.topology.clone(), config.retry.ttl_ms),
        reconnect_delay(config),
    )
}

/// Supervised consumer with optional health server
pub async fn run_consumer(config: AppConfig) -> Result<()> {
    let shutdown = Arc::new(GracefulShutdown::default());
    install_signal_handlers(shutdown.clone());

    let mut listener = shutdown.listener();
    let store = connect_store(&config, &mut listener).await?;
    let store: Arc<dyn OrderStore> = store;

    let effect = effect_from_config(&config.effect);
    info!("Business effect: {}", effect.name());
    let processor = Arc::new(MessageProcessor::new(
        ProcessorConfig::from_app(&config),
        store.clone(),
        effect,
    ));
    let supervisor = Arc::new(supervisor_for(&config));

    if let Some(port) = config.health_port {
        let state = Arc::new(HealthState::new().with_processor_stats(processor.stats_handle()));
        state.track_connection(supervisor.subscribe());
        state.probe_store(store.clone(), Duration::from_secs(10), shutdown.listener());

        let server = HealthServer::new(state, port);
        let listener = shutdown.listener();
        tokio::spawn(async move {
            if let Err(e) = server.run(listener).await {
                error!("Health server stopped: {}", e);
            }
        });
    }

    let run = supervisor.run(Some(processor.clone()), shutdown.listener());
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result?,
        _ = listener.wait() => {
            if let Some(signal) = shutdown.signal() {
                info!("Draining consumer after {} shutdown", signal);
            }
            // In-flight deliveries finish before the consumer returns
            shutdown.drain(async { let _ = (&mut run).await; }).await;
        }
    }

    let stats = processor.stats().await;
    info!(
        "Consumer stopped: {} received, {} completed, {} retried, {} failed",
        stats.received, stats.completed, stats.retried, stats.failed
    );
    Ok(())
}

/// Ingress API; keeps its own supervised channel for publishing
pub async fn run_api(config: AppConfig, bind: Option<String>) -> Result<()> {
    let shutdown = Arc::new(GracefulShutdown::default());
    install_signal_handlers(shutdown.clone());

    let mut listener = shutdown.listener();
    let store = connect_store(&config, &mut listener).await?;

    let supervisor = Arc::new(supervisor_for(&config));
    let producer = Arc::new(OrderProducer::new(
        store,
        supervisor.channel_slot(),
        &config.topology,
    ));

    let broker_task = {
        let supervisor = supervisor.clone();
        let listener = shutdown.listener();
        tokio::spawn(async move { supervisor.run(None, listener).await })
    };

    let app = create_router(AppState::new(producer));
    let addr = bind.unwrap_or_else(|| config.api.bind.clone());
    let tcp = tokio::net::TcpListener::bind(&addr).await?;
    info!("API service listening on {}", addr);

    axum::serve(tcp, app)
        .with_graceful_shutdown(async move { listener.wait().await })
        .await
        .map_err(|e| OrderflowError::Internal(format!("API server error: {}", e)))?;

    if let Ok(Err(e)) = broker_task.await {
        error!("Broker supervisor failed: {}", e);
    }
    Ok(())
}

/// Declare the topology once
pub async fn declare_topology(config: &AppConfig) -> Result<()> {
    let channel = RabbitConnector::new(config.broker.url.clone())
        .connect()
        .await?;
    TopologyManager::new(config.topology.clone(), config.retry.ttl_ms)
        .declare(channel.as_ref())
        .await
}

/// Submit a single order from the command line
pub async fn submit_once(config: &AppConfig, new_order: NewOrder) -> Result<SubmittedOrder> {
    let store = PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;

    let channel = RabbitConnector::new(config.broker.url.clone())
        .connect()
        .await?;
    TopologyManager::new(config.topology.clone(), config.retry.ttl_ms)
        .declare(channel.as_ref())
        .await?;

    let producer = OrderProducer::new(
        Arc::new(store),
        Arc::new(tokio::sync::RwLock::new(Some(channel))),
        &config.topology,
    );
    producer.submit(new_order).await
}
