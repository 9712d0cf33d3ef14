use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Order, OrderStatus};
use crate::error::{OrderflowError, Result};

/// Payload carried by a broker delivery.
///
/// Only `order_id` is load-bearing. The remaining fields are a snapshot taken
/// by the producer and are never used for processing decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMessage {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderMessage {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.order_id.clone(),
            user_id: Some(order.user_id.clone()),
            product_id: Some(order.product_id.clone()),
            quantity: Some(i64::from(order.quantity)),
            status: Some(order.status),
            timestamp: Some(order.created_at),
        }
    }

    /// Parse a raw delivery body.
    ///
    /// Fails only when the body is not a JSON object or has no usable
    /// `orderId`; advisory fields with unexpected shapes are dropped.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| OrderflowError::MalformedDelivery(format!("invalid JSON: {e}")))?;

        let object = value.as_object().ok_or_else(|| {
            OrderflowError::MalformedDelivery("payload is not a JSON object".to_string())
        })?;

        let order_id = object
            .get("orderId")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OrderflowError::MalformedDelivery("missing orderId".to_string()))?
            .to_string();

        let text = |key: &str| object.get(key).and_then(Value::as_str).map(String::from);

        Ok(Self {
            order_id,
            user_id: text("userId"),
            product_id: text("productId"),
            quantity: object.get("quantity").and_then(Value::as_i64),
            status: text("status").and_then(|s| OrderStatus::try_from(s.as_str()).ok()),
            timestamp: text("timestamp").and_then(|s| s.parse().ok()),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewOrder;

    #[test]
    fn test_parse_minimal_payload() {
        let msg = OrderMessage::parse(br#"{"orderId":"o1"}"#).unwrap();
        assert_eq!(msg.order_id, "o1");
        assert!(msg.quantity.is_none());
    }

    #[test]
    fn test_parse_producer_payload() {
        let payload = br#"{
            "orderId": "o1",
            "userId": "u1",
            "productId": "p1",
            "quantity": 2,
            "status": "PENDING",
            "timestamp": "2024-05-01T10:00:00.000Z"
        }"#;
        let msg = OrderMessage::parse(payload).unwrap();
        assert_eq!(msg.user_id.as_deref(), Some("u1"));
        assert_eq!(msg.quantity, Some(2));
        assert_eq!(msg.status, Some(OrderStatus::Pending));
        assert!(msg.timestamp.is_some());
    }

    #[test]
    fn test_advisory_fields_do_not_break_parsing() {
        let msg =
            OrderMessage::parse(br#"{"orderId":"o1","quantity":"lots","status":42}"#).unwrap();
        assert_eq!(msg.order_id, "o1");
        assert!(msg.quantity.is_none());
        assert!(msg.status.is_none());
    }

    #[test]
    fn test_malformed_payloads() {
        for payload in [
            &b"not json"[..],
            br#"[1,2,3]"#,
            br#"{"userId":"u1"}"#,
            br#"{"orderId":""}"#,
            br#"{"orderId":17}"#,
        ] {
            let err = OrderMessage::parse(payload).unwrap_err();
            assert!(
                matches!(err, OrderflowError::MalformedDelivery(_)),
                "unexpected error for {:?}: {err}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn test_from_order_carries_identifier() {
        let order = NewOrder {
            user_id: "u1".into(),
            product_id: "p1".into(),
            quantity: 3,
        }
        .into_order();

        let bytes = OrderMessage::from_order(&order).to_bytes().unwrap();
        let parsed = OrderMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.order_id, order.order_id);
        assert_eq!(parsed.quantity, Some(3));
    }
}
