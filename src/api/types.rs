use serde::{Deserialize, Serialize};

// ============================================================================
// Order Types
// ============================================================================

/// 202 body for an accepted submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOrderResponse {
    pub message: String,
    pub order_id: String,
}

impl SubmitOrderResponse {
    pub fn accepted(order_id: String) -> Self {
        Self {
            message: "Order received for processing".to_string(),
            order_id,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
