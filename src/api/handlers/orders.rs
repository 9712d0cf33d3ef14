use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use tracing::{debug, error};

use crate::api::{state::AppState, types::*};
use crate::domain::{NewOrder, Order};
use crate::error::OrderflowError;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn invalid_input() -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new("Invalid input")),
    )
}

fn internal_error() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("Internal Server Error")),
    )
}

/// POST /api/orders
pub async fn create_order(
    State(state): State<AppState>,
    body: std::result::Result<Json<NewOrder>, JsonRejection>,
) -> std::result::Result<(StatusCode, Json<SubmitOrderResponse>), ApiError> {
    let Json(new_order) = body.map_err(|e| {
        debug!("Rejected order body: {}", e);
        invalid_input()
    })?;

    match state.producer.submit(new_order).await {
        Ok(submitted) => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitOrderResponse::accepted(submitted.order.order_id)),
        )),
        Err(OrderflowError::Validation(reason)) => {
            debug!("Rejected order: {}", reason);
            Err(invalid_input())
        }
        Err(e) => {
            error!("Order submission failed: {}", e);
            Err(internal_error())
        }
    }
}

/// GET /api/orders/:order_id
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> std::result::Result<Json<Order>, ApiError> {
    match state.store.get_order(&order_id).await {
        Ok(Some(order)) => Ok(Json(order)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Order not found")),
        )),
        Err(e) => {
            error!("Order lookup failed for {}: {}", order_id, e);
            Err(internal_error())
        }
    }
}
