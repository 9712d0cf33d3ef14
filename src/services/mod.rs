pub mod health;

pub use health::{
    health_router, ComponentHealth, HealthResponse, HealthServer, HealthState, HealthStatus,
};
