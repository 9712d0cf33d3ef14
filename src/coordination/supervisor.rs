//! Connection Supervisor
//!
//! Owns the broker channel's lifecycle. Every connection attempt is retried
//! forever with a fixed delay; after each (re)connect the topology is declared
//! again and the consumer re-registered, and subscribers are told about every
//! transition through a broadcast channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use crate::adapters::traits::{BrokerChannel, BrokerConnector};
use crate::coordination::shutdown::ShutdownListener;
use crate::error::Result;
use crate::pipeline::processor::{MessageProcessor, RunExit};
use crate::pipeline::topology::TopologyManager;

/// The channel currently owned by the supervisor, if connected
pub type ChannelSlot = Arc<RwLock<Option<Arc<dyn BrokerChannel>>>>;

/// Broker connection transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connected and topology declared
    Connected { generation: u64 },
    Disconnected { generation: u64, reason: String },
}

/// Run `attempt` until it succeeds, sleeping `delay` between failures.
///
/// Returns `None` only when shutdown is requested.
pub async fn retry_forever<T, F, Fut>(
    what: &str,
    delay: Duration,
    shutdown: &mut ShutdownListener,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts: u64 = 0;
    loop {
        if shutdown.is_requested() {
            return None;
        }
        attempts += 1;

        match attempt().await {
            Ok(value) => {
                if attempts > 1 {
                    info!("{} succeeded after {} attempts", what, attempts);
                }
                return Some(value);
            }
            Err(e) => warn!(
                "{} failed (attempt {}): {}. Retrying in {:?}",
                what, attempts, e, delay
            ),
        }

        tokio::select! {
            _ = shutdown.wait() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Connection supervisor
pub struct ConnectionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    topology: TopologyManager,
    reconnect_delay: Duration,
    channel: ChannelSlot,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        topology: TopologyManager,
        reconnect_delay: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connector,
            topology,
            reconnect_delay,
            channel: Arc::new(RwLock::new(None)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Shared slot other components publish through (e.g. the producer)
    pub fn channel_slot(&self) -> ChannelSlot {
        self.channel.clone()
    }

    /// Connect and declare the topology, retrying until both succeed.
    pub async fn connect(&self, shutdown: &mut ShutdownListener) -> Option<Arc<dyn BrokerChannel>> {
        retry_forever("Broker connection", self.reconnect_delay, shutdown, || async move {
            let channel = self.connector.connect().await?;
            self.topology.declare(channel.as_ref()).await?;
            Ok(channel)
        })
        .await
    }

    /// Keep a channel alive until shutdown.
    ///
    /// With a processor, its consumer is (re)registered on every channel and
    /// a closed delivery stream counts as a disconnect. Without one, the
    /// channel is only held open for publishers.
    pub async fn run(
        &self,
        processor: Option<Arc<MessageProcessor>>,
        shutdown: ShutdownListener,
    ) -> Result<()> {
        let mut listener = shutdown.clone();
        let mut generation: u64 = 0;

        loop {
            let Some(channel) = self.connect(&mut listener).await else {
                break;
            };
            generation += 1;
            *self.channel.write().await = Some(channel.clone());
            info!("Broker connected (generation {})", generation);
            let _ = self.events.send(ConnectionEvent::Connected { generation });

            let reason = match &processor {
                Some(processor) => match processor.run(channel, shutdown.clone()).await {
                    Ok(RunExit::Shutdown) => None,
                    Ok(RunExit::StreamClosed) => Some("delivery stream closed".to_string()),
                    Err(e) => Some(e.to_string()),
                },
                None => self.watch_channel(channel.as_ref(), &mut listener).await,
            };

            *self.channel.write().await = None;
            let Some(reason) = reason else {
                break;
            };

            error!("Broker connection lost: {}", reason);
            let _ = self.events.send(ConnectionEvent::Disconnected { generation, reason });

            tokio::select! {
                _ = listener.wait() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!("Connection supervisor stopped");
        Ok(())
    }

    /// Poll the channel until it drops (returns the reason) or shutdown.
    async fn watch_channel(
        &self,
        channel: &dyn BrokerChannel,
        shutdown: &mut ShutdownListener,
    ) -> Option<String> {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return None,
                _ = tokio::time::sleep(self.reconnect_delay) => {
                    if !channel.is_connected() {
                        return Some("channel closed".to_string());
                    }
                }
            }
        }
    }
}
