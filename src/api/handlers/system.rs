use axum::http::StatusCode;

/// GET /health
pub async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
