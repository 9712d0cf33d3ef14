//! Ingress API: order submission, status lookup and a liveness probe.

pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;

pub use routes::create_router;
pub use state::AppState;
