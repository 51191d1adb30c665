//! Cluster node registry consulted by cluster authentication.
//!
//! The registry is owned by cluster membership management; this crate only
//! reads it. [`NodeRegistry`] is the query contract, [`InMemoryNodeRegistry`]
//! an implementation seeded from a JSON file for single-process deployments
//! and tests.
//!
//! # File Format
//!
//! ```json
//! [
//!   { "node_id": "storage-1", "shared_secret": "…", "health_status": "healthy" },
//!   { "node_id": "storage-2", "shared_secret": "…", "health_status": "degraded" }
//! ]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

/// Health of a cluster member as recorded by membership management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Unavailable,
    /// No longer a cluster member. Never eligible for authentication.
    Removed,
}

impl NodeHealth {
    /// Whether a node in this state may still prove its identity.
    pub fn can_authenticate(&self) -> bool {
        !matches!(self, Self::Removed)
    }
}

/// Registry entry for one node.
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_id: String,
    pub shared_secret: String,
    pub health_status: NodeHealth,
}

impl NodeEntry {
    pub fn new(node_id: impl Into<String>, shared_secret: impl Into<String>, health_status: NodeHealth) -> Self {
        Self {
            node_id: node_id.into(),
            shared_secret: shared_secret.into(),
            health_status,
        }
    }
}

// Keep shared secrets out of logs
impl fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEntry")
            .field("node_id", &self.node_id)
            .field("shared_secret", &"<redacted>")
            .field("health_status", &self.health_status)
            .finish()
    }
}

/// Registry infrastructure failure.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Node registry unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to load node registry: {0}")]
    Load(String),
}

/// Query contract of the cluster node registry.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Look up `node_id`, excluding nodes whose status is `removed`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(entry))` for a current member (healthy, degraded or unavailable)
    /// - `Ok(None)` if the node is unknown or removed
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the backing store cannot be queried.
    async fn find_active_node(&self, node_id: &str) -> Result<Option<NodeEntry>, RegistryError>;
}

/// Node registry held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryNodeRegistry {
    nodes: RwLock<HashMap<String, NodeEntry>>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = NodeEntry>) -> Self {
        let nodes = entries
            .into_iter()
            .map(|entry| (entry.node_id.clone(), entry))
            .collect();
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Parse a JSON array of [`NodeEntry`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Load`] on malformed JSON or duplicate node ids.
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let entries: Vec<NodeEntry> =
            serde_json::from_str(json).map_err(|e| RegistryError::Load(e.to_string()))?;

        let mut nodes = HashMap::with_capacity(entries.len());
        for entry in entries {
            if nodes.contains_key(&entry.node_id) {
                return Err(RegistryError::Load(format!(
                    "duplicate node id '{}'",
                    entry.node_id
                )));
            }
            nodes.insert(entry.node_id.clone(), entry);
        }

        Ok(Self {
            nodes: RwLock::new(nodes),
        })
    }

    /// Load a registry file (see module docs for the format).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Load`] if the file cannot be read or parsed.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RegistryError::Load(format!("{}: {e}", path.display())))?;

        let registry = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            nodes = registry.len().await,
            "Node registry loaded"
        );
        Ok(registry)
    }

    /// Insert or replace a node.
    pub async fn upsert(&self, entry: NodeEntry) {
        self.nodes.write().await.insert(entry.node_id.clone(), entry);
    }

    /// Update a node's health. Returns `false` if the node is unknown.
    pub async fn set_health(&self, node_id: &str, health: NodeHealth) -> bool {
        match self.nodes.write().await.get_mut(node_id) {
            Some(entry) => {
                entry.health_status = health;
                true
            }
            None => false,
        }
    }

    /// Number of entries, removed nodes included.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[async_trait]
impl NodeRegistry for InMemoryNodeRegistry {
    async fn find_active_node(&self, node_id: &str) -> Result<Option<NodeEntry>, RegistryError> {
        Ok(self
            .nodes
            .read()
            .await
            .get(node_id)
            .filter(|entry| entry.health_status.can_authenticate())
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_active_statuses_are_found() {
        let registry = InMemoryNodeRegistry::from_entries([
            NodeEntry::new("n-healthy", "s1", NodeHealth::Healthy),
            NodeEntry::new("n-degraded", "s2", NodeHealth::Degraded),
            NodeEntry::new("n-unavailable", "s3", NodeHealth::Unavailable),
        ]);

        for id in ["n-healthy", "n-degraded", "n-unavailable"] {
            let entry = registry.find_active_node(id).await.unwrap();
            assert_eq!(entry.unwrap().node_id, id);
        }
    }

    #[tokio::test]
    async fn test_removed_node_looks_like_unknown_node() {
        let registry =
            InMemoryNodeRegistry::from_entries([NodeEntry::new("gone", "s", NodeHealth::Removed)]);

        assert!(registry.find_active_node("gone").await.unwrap().is_none());
        assert!(registry.find_active_node("never-existed").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_health_and_upsert() {
        let registry = InMemoryNodeRegistry::new();
        assert!(!registry.set_health("n1", NodeHealth::Removed).await);

        registry.upsert(NodeEntry::new("n1", "secret", NodeHealth::Healthy)).await;
        assert!(registry.find_active_node("n1").await.unwrap().is_some());

        assert!(registry.set_health("n1", NodeHealth::Removed).await);
        assert!(registry.find_active_node("n1").await.unwrap().is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_from_json() {
        let registry = InMemoryNodeRegistry::from_json(
            r#"[
                {"node_id": "a", "shared_secret": "sa", "health_status": "healthy"},
                {"node_id": "b", "shared_secret": "sb", "health_status": "removed"}
            ]"#,
        )
        .unwrap();

        assert_eq!(registry.len().await, 2);
        let a = registry.find_active_node("a").await.unwrap().unwrap();
        assert_eq!(a.shared_secret, "sa");
        assert!(registry.find_active_node("b").await.unwrap().is_none());
    }

    #[test]
    fn test_from_json_rejects_duplicates_and_bad_status() {
        let dup = r#"[
            {"node_id": "a", "shared_secret": "1", "health_status": "healthy"},
            {"node_id": "a", "shared_secret": "2", "health_status": "healthy"}
        ]"#;
        assert!(matches!(
            InMemoryNodeRegistry::from_json(dup),
            Err(RegistryError::Load(_))
        ));

        let bad = r#"[{"node_id": "a", "shared_secret": "1", "health_status": "zombie"}]"#;
        assert!(InMemoryNodeRegistry::from_json(bad).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let entry = NodeEntry::new("n1", "super-secret", NodeHealth::Healthy);
        let rendered = format!("{entry:?}");
        assert!(rendered.contains("n1"));
        assert!(!rendered.contains("super-secret"));
    }
}
