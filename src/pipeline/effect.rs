//! Business effect applied to an order
//!
//! The processor guards every effect with the idempotency ledger, so an
//! implementation runs at most once per order unless it fails.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::config::EffectConfig;
use crate::domain::Order;
use crate::error::{OrderflowError, Result};

#[async_trait]
pub trait OrderEffect: Send + Sync {
    /// Do the work for `order`. Any error sends the delivery down the retry path.
    async fn apply(&self, order: &Order) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Placeholder effect: the order is considered fulfilled as soon as it is seen
pub struct NoopEffect;

#[async_trait]
impl OrderEffect for NoopEffect {
    async fn apply(&self, order: &Order) -> Result<()> {
        debug!("Fulfilling order {} ({} x {})", order.order_id, order.quantity, order.product_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Fails every order with a given quantity
pub struct SimulatedFailureEffect {
    fail_on_quantity: i32,
}

impl SimulatedFailureEffect {
    pub fn new(fail_on_quantity: i32) -> Self {
        Self { fail_on_quantity }
    }
}

#[async_trait]
impl OrderEffect for SimulatedFailureEffect {
    async fn apply(&self, order: &Order) -> Result<()> {
        if order.quantity == self.fail_on_quantity {
            return Err(OrderflowError::Effect(format!(
                "simulated failure for quantity {}",
                order.quantity
            )));
        }
        NoopEffect.apply(order).await
    }

    fn name(&self) -> &'static str {
        "simulated-failure"
    }
}

pub fn effect_from_config(config: &EffectConfig) -> Arc<dyn OrderEffect> {
    match config.fail_on_quantity {
        Some(quantity) => Arc::new(SimulatedFailureEffect::new(quantity)),
        None => Arc::new(NoopEffect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewOrder;

    fn order(quantity: i32) -> Order {
        NewOrder {
            user_id: "u1".into(),
            product_id: "p1".into(),
            quantity,
        }
        .into_order()
    }

    #[tokio::test]
    async fn test_simulated_failure_only_hits_configured_quantity() {
        let effect = SimulatedFailureEffect::new(999);
        assert!(effect.apply(&order(2)).await.is_ok());
        assert!(matches!(
            effect.apply(&order(999)).await,
            Err(OrderflowError::Effect(_))
        ));
    }

    #[test]
    fn test_effect_from_config() {
        let noop = effect_from_config(&EffectConfig::default());
        assert_eq!(noop.name(), "noop");

        let failing = effect_from_config(&EffectConfig {
            fail_on_quantity: Some(999),
        });
        assert_eq!(failing.name(), "simulated-failure");
    }
}
