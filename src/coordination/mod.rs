//! Coordination layer: broker connection supervision and graceful shutdown.

pub mod shutdown;
pub mod supervisor;

pub use shutdown::{install_signal_handlers, GracefulShutdown, ShutdownListener, ShutdownSignal};
pub use supervisor::{retry_forever, ChannelSlot, ConnectionEvent, ConnectionSupervisor};
