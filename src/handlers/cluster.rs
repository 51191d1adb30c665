//! Internal cluster RPC endpoints.
//!
//! Everything here sits behind cluster authentication, so handlers can rely on
//! the [`VerifiedNode`] extension being present.

use axum::Json;
use axum::extract::Extension;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::middleware::VerifiedNode;
use crate::models::WhoAmIResponse;

/// Echo the identity the caller authenticated as.
///
/// Peers use this to check their clock and shared secret before starting
/// replication traffic.
#[instrument(skip_all)]
pub async fn whoami(Extension(node): Extension<VerifiedNode>) -> Json<WhoAmIResponse> {
    debug!(node_id = %node.0, "Cluster identity check");
    Json(WhoAmIResponse {
        node_id: node.0,
        authenticated_at: Utc::now(),
    })
}
