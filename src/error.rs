use thiserror::Error;

/// Main error type for the order pipeline
#[derive(Error, Debug)]
pub enum OrderflowError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Broker errors
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Delivery errors
    #[error("Malformed delivery: {0}")]
    MalformedDelivery(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Business effect errors
    #[error("Business effect failed: {0}")]
    Effect(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl OrderflowError {
    /// Errors that no amount of redelivery can fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            OrderflowError::MalformedDelivery(_)
                | OrderflowError::OrderNotFound(_)
                | OrderflowError::Validation(_)
        )
    }
}

/// Result type alias for OrderflowError
pub type Result<T> = std::result::Result<T, OrderflowError>;
