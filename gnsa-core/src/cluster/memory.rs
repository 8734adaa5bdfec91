//! In-memory cluster for testing and dry setups

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{ClusterApi, ClusterError, NodeState};

/// Kind of call made against the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOp {
    Get,
    Cordon,
    Delete,
    UpdateLabels,
}

impl ClusterOp {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, ClusterOp::Get)
    }
}

/// One recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCall {
    pub op: ClusterOp,
    pub node: String,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, NodeState>,
    calls: Vec<ClusterCall>,
    failures: VecDeque<(ClusterOp, ClusterError)>,
    deny_all: bool,
    delay: Option<Duration>,
}

/// Cluster fake that records every call in an action log
#[derive(Default)]
pub struct InMemoryCluster {
    inner: Mutex<Inner>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cluster containing schedulable nodes with the given names
    pub fn with_nodes(names: &[&str]) -> Self {
        let cluster = Self::new();
        {
            let mut inner = cluster.lock();
            for name in names {
                inner.nodes.insert(name.to_string(), NodeState::new(*name));
            }
        }
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state of a node
    pub fn node(&self, name: &str) -> Option<NodeState> {
        self.lock().nodes.get(name).cloned()
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<ClusterCall> {
        self.lock().calls.clone()
    }

    /// Calls that change cluster state
    pub fn mutations(&self) -> Vec<ClusterCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op.is_mutation())
            .cloned()
            .collect()
    }

    /// Fail the next call of kind `op` with `error`
    pub fn fail_next(&self, op: ClusterOp, error: ClusterError) {
        self.lock().failures.push_back((op, error));
    }

    /// Reject every call with a permission error
    pub fn deny_all(&self) {
        self.lock().deny_all = true;
    }

    /// Delay every call, to exercise timeouts
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Add a schedulable node, as kubelet registration would
    pub fn register(&self, name: &str) {
        self.lock()
            .nodes
            .insert(name.to_string(), NodeState::new(name));
    }

    /// Mark a node schedulable, as an operator would
    pub fn uncordon(&self, name: &str) {
        if let Some(node) = self.lock().nodes.get_mut(name) {
            node.unschedulable = false;
        }
    }

    async fn begin(&self, op: ClusterOp, name: &str) -> Result<(), ClusterError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.push(ClusterCall {
                op,
                node: name.to_string(),
            });
            if inner.deny_all {
                return Err(ClusterError::Permission(format!(
                    "nodes {:?} is forbidden",
                    name
                )));
            }
            if let Some(pos) = inner.failures.iter().position(|(o, _)| *o == op) {
                if let Some((_, error)) = inner.failures.remove(pos) {
                    return Err(error);
                }
            }
            inner.delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn with_node<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut NodeState) -> T,
    ) -> Result<T, ClusterError> {
        let mut inner = self.lock();
        inner
            .nodes
            .get_mut(name)
            .map(f)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_node(&self, name: &str) -> Result<NodeState, ClusterError> {
        self.begin(ClusterOp::Get, name).await?;
        self.with_node(name, |node| node.clone())
    }

    async fn cordon_node(&self, name: &str) -> Result<(), ClusterError> {
        self.begin(ClusterOp::Cordon, name).await?;
        self.with_node(name, |node| node.unschedulable = true)
    }

    async fn delete_node(&self, name: &str) -> Result<(), ClusterError> {
        self.begin(ClusterOp::Delete, name).await?;
        self.lock()
            .nodes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn update_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        self.begin(ClusterOp::UpdateLabels, name).await?;
        self.with_node(name, |node| {
            node.labels
                .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls() {
        let cluster = InMemoryCluster::with_nodes(&["a"]);
        cluster.cordon_node("a").await.unwrap();
        cluster.get_node("a").await.unwrap();

        assert_eq!(cluster.calls().len(), 2);
        assert_eq!(cluster.mutations().len(), 1);
        assert!(cluster.node("a").unwrap().unschedulable);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let cluster = InMemoryCluster::with_nodes(&["a"]);
        cluster.fail_next(ClusterOp::Cordon, ClusterError::Api("boom".to_string()));

        tokio_test::assert_err!(cluster.cordon_node("a").await);
        tokio_test::assert_ok!(cluster.cordon_node("a").await);
    }

    #[tokio::test]
    async fn test_missing_node() {
        let cluster = InMemoryCluster::new();
        assert_eq!(
            cluster.delete_node("ghost").await,
            Err(ClusterError::NotFound("ghost".to_string()))
        );
    }
}
