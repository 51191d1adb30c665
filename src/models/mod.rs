mod api;

pub use api::{HealthResponse, ReadinessResponse, WhoAmIResponse};
