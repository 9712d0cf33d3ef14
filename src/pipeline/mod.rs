//! Order pipeline: routing graph, retry decision, business effect, the
//! consumer state machine and the producer side of the contract.

pub mod effect;
pub mod processor;
pub mod producer;
pub mod retry;
pub mod topology;

pub use effect::{effect_from_config, NoopEffect, OrderEffect, SimulatedFailureEffect};
pub use processor::{
    MessageProcessor, ProcessingOutcome, ProcessorConfig, ProcessorStats, RunExit,
};
pub use producer::{OrderProducer, SubmittedOrder};
pub use retry::{decide, RetryDecision, RetryPolicy};
pub use topology::TopologyManager;
