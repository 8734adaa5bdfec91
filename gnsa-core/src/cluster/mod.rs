//! Cluster control-plane abstraction
//!
//! [`ClusterApi`] is the seam to the orchestrator. The executor never holds a
//! `ClusterApi` directly: it goes through [`NodeScope`], which binds the API
//! to the agent's own [`NodeIdentity`] and applies the per-call timeout.

mod memory;

pub use memory::{ClusterCall, ClusterOp, InMemoryCluster};

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ConfigError;

/// The node's own name, bound once at startup
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::MissingNodeName);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The subset of a node object the agent reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeState {
    pub name: String,
    pub unschedulable: bool,
    pub labels: BTreeMap<String, String>,
}

impl NodeState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Errors returned by cluster operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Transient API failure
    #[error("cluster API error: {0}")]
    Api(String),

    /// Call exceeded the per-call timeout
    #[error("cluster API call timed out after {0:?}")]
    Timeout(Duration),

    /// Node object not found
    #[error("node not found: {0}")]
    NotFound(String),

    /// Missing authority for the requested operation
    #[error("permission denied: {0}")]
    Permission(String),

    /// A call or response named a node other than our own
    #[error("refusing to act on node {requested:?}: agent is scoped to {own:?}")]
    ForeignNode { requested: String, own: String },
}

impl ClusterError {
    /// Retried on a later tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Api(_) | ClusterError::Timeout(_) | ClusterError::NotFound(_)
        )
    }

    /// Ends mutation for the rest of the process lifetime
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

/// Cluster control-plane operations on node objects
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Read a node
    async fn get_node(&self, name: &str) -> Result<NodeState, ClusterError>;

    /// Mark a node unschedulable
    async fn cordon_node(&self, name: &str) -> Result<(), ClusterError>;

    /// Delete a node object
    async fn delete_node(&self, name: &str) -> Result<(), ClusterError>;

    /// Merge labels into a node's metadata
    async fn update_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError>;
}

/// A [`ClusterApi`] restricted to a single node.
///
/// Nothing reachable through a scope can name another node, regardless of
/// the RBAC grant behind the underlying client.
pub struct NodeScope {
    api: Arc<dyn ClusterApi>,
    node: NodeIdentity,
    timeout: Duration,
}

impl NodeScope {
    pub fn new(api: Arc<dyn ClusterApi>, node: NodeIdentity, timeout: Duration) -> Self {
        Self { api, node, timeout }
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, ClusterError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ClusterError::Timeout(self.timeout))?
    }

    /// Read our own node, rejecting a response for any other node
    pub async fn get(&self) -> Result<NodeState, ClusterError> {
        let state = self.call(self.api.get_node(self.node.as_str())).await?;
        if state.name != self.node.as_str() {
            return Err(ClusterError::ForeignNode {
                requested: state.name,
                own: self.node.to_string(),
            });
        }
        Ok(state)
    }

    pub async fn cordon(&self) -> Result<(), ClusterError> {
        self.call(self.api.cordon_node(self.node.as_str())).await
    }

    pub async fn delete(&self) -> Result<(), ClusterError> {
        self.call(self.api.delete_node(self.node.as_str())).await
    }

    pub async fn update_labels(&self, labels: &BTreeMap<String, String>) -> Result<(), ClusterError> {
        self.call(self.api.update_node_labels(self.node.as_str(), labels))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_identity_rejects_blank() {
        assert!(NodeIdentity::new("").is_err());
        assert!(NodeIdentity::new("   ").is_err());
        assert_eq!(NodeIdentity::new(" gpu-7 ").unwrap().as_str(), "gpu-7");
    }

    #[test]
    fn test_error_classification() {
        assert!(ClusterError::Api("503".to_string()).is_transient());
        assert!(ClusterError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ClusterError::Permission("forbidden".to_string()).is_fatal());
        assert!(ClusterError::ForeignNode {
            requested: "b".to_string(),
            own: "a".to_string()
        }
        .is_fatal());
    }

    #[tokio::test]
    async fn test_scope_targets_own_node() {
        let cluster = Arc::new(InMemoryCluster::with_nodes(&["node-a", "node-b"]));
        let scope = NodeScope::new(
            cluster.clone(),
            NodeIdentity::new("node-a").unwrap(),
            Duration::from_secs(1),
        );

        scope.cordon().await.unwrap();
        assert!(cluster.node("node-a").unwrap().unschedulable);
        assert!(!cluster.node("node-b").unwrap().unschedulable);
        assert!(cluster.calls().iter().all(|c| c.node == "node-a"));
    }

    #[tokio::test]
    async fn test_scope_times_out() {
        let cluster = Arc::new(InMemoryCluster::with_nodes(&["node-a"]));
        cluster.set_delay(Duration::from_millis(200));
        let scope = NodeScope::new(
            cluster,
            NodeIdentity::new("node-a").unwrap(),
            Duration::from_millis(20),
        );

        let err = scope.cordon().await.unwrap_err();
        assert_eq!(err, ClusterError::Timeout(Duration::from_millis(20)));
        assert!(err.is_transient());
    }
}
