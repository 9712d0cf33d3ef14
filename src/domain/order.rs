use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{OrderflowError, Result};

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Persisted by the producer, not yet picked up
    Pending,
    /// A delivery is (or was) working on it; also the state held between retries
    Processing,
    /// Effect applied and ledger entry written
    Completed,
    /// Retries exhausted
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Failed)
    }

    /// Check if this status can move to another one.
    ///
    /// Transitions only go forward. `Processing -> Processing` is the re-entry
    /// of a retried delivery; `Pending -> Failed` covers an order that never
    /// got past the first store write before its retries ran out.
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, target) {
            (Pending, Processing) => true,
            (Pending, Failed) => true,

            (Processing, Processing) => true,
            (Processing, Completed) => true,
            (Processing, Failed) => true,

            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = OrderflowError;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(OrderStatus::Pending),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "COMPLETED" => Ok(OrderStatus::Completed),
            "FAILED" => Ok(OrderStatus::Failed),
            other => Err(OrderflowError::Internal(format!(
                "Unknown order status: {other}"
            ))),
        }
    }
}

/// Order submission (what the client asked for)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub user_id: String,
    pub product_id: String,
    pub quantity: i32,
}

impl NewOrder {
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(OrderflowError::Validation("userId is required".to_string()));
        }
        if self.product_id.trim().is_empty() {
            return Err(OrderflowError::Validation(
                "productId is required".to_string(),
            ));
        }
        if self.quantity <= 0 {
            return Err(OrderflowError::Validation(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        Ok(())
    }

    /// Assign a fresh identifier and the initial state.
    pub fn into_order(self) -> Order {
        Order {
            order_id: Uuid::new_v4().to_string(),
            user_id: self.user_id,
            product_id: self.product_id,
            quantity: self.quantity,
            status: OrderStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// Order (authoritative record in the store)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub product_id: String,
    pub quantity: i32,
    pub status: OrderStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
