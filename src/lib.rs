//! # Cluster Admission Control
//!
//! The admission layer of an S3-compatible object storage cluster. Every
//! request passes here before business logic:
//!
//! - **Cluster authentication**: peer nodes sign internal RPC with HMAC-SHA256
//!   over method, path, timestamp and nonce, keyed by a per-node shared secret
//! - **Rate limiting**: token buckets per client key, with forwarded-address
//!   headers believed only from trusted relays
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Request ID → Trace → Cluster Auth → Rate Limit             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TrustResolver │ KeyExtractor │ RateLimitStore │ Registry   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, cluster whoami, S3 placeholder)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cluster_admission::{AppState, Config, InMemoryNodeRegistry, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let registry = InMemoryNodeRegistry::from_json(r#"[
//!         {"node_id": "storage-1", "shared_secret": "s1", "health_status": "healthy"}
//!     ]"#)?;
//!
//!     let state = AppState::new(config, Arc::new(registry));
//!     let app = build_router(state)?;
//!
//!     // Serve with `into_make_service_with_connect_info::<SocketAddr>()`...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod ratelimit;
pub mod registry;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use ratelimit::{InMemoryRateLimitStore, RateLimitStore, TokenBucket};
pub use registry::{InMemoryNodeRegistry, NodeEntry, NodeHealth, NodeRegistry};
pub use routes::build_router;
pub use state::AppState;
