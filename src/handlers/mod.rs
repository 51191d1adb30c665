mod cluster;
mod health;
mod s3;

pub use cluster::whoami;
pub use health::{health_check, readiness_check};
pub use s3::s3_fallback;
