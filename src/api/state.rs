use std::sync::Arc;

use crate::adapters::traits::OrderStore;
use crate::pipeline::OrderProducer;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    /// Persists and publishes new orders
    pub producer: Arc<OrderProducer>,

    /// Status reads go straight to the store
    pub store: Arc<dyn OrderStore>,
}

impl AppState {
    pub fn new(producer: Arc<OrderProducer>) -> Self {
        let store = producer.store().clone();
        Self {
            producer,
            store,
        }
    }
}
