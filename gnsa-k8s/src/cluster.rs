//! `ClusterApi` implementation for Kubernetes
//!
//! Maps API server responses onto the agent's error taxonomy: 401/403 are
//! permission failures, 404 is a missing node, anything else is transient.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use gnsa_core::cluster::{ClusterApi, ClusterError, NodeState};

use super::client::K8sClient;

/// Classify a kube error
pub fn classify_kube_error(error: kube::Error) -> ClusterError {
    match error {
        kube::Error::Api(response) => match response.code {
            401 | 403 => ClusterError::Permission(response.message),
            404 => ClusterError::NotFound(response.message),
            code => ClusterError::Api(format!(
                "{} ({}): {}",
                response.reason, code, response.message
            )),
        },
        other => ClusterError::Api(other.to_string()),
    }
}

/// Project a Node object onto the fields the agent reads
pub fn node_state(node: &Node) -> NodeState {
    NodeState {
        name: node.metadata.name.clone().unwrap_or_default(),
        unschedulable: node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false),
        labels: node.metadata.labels.clone().unwrap_or_default(),
    }
}

#[async_trait]
impl ClusterApi for K8sClient {
    async fn get_node(&self, name: &str) -> Result<NodeState, ClusterError> {
        let node = self.fetch_node(name).await.map_err(classify_kube_error)?;
        debug!(node = name, "Fetched node");
        Ok(node_state(&node))
    }

    async fn cordon_node(&self, name: &str) -> Result<(), ClusterError> {
        self.patch_unschedulable(name)
            .await
            .map_err(classify_kube_error)
    }

    async fn delete_node(&self, name: &str) -> Result<(), ClusterError> {
        self.remove_node(name).await.map_err(classify_kube_error)
    }

    async fn update_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        self.patch_labels(name, labels)
            .await
            .map_err(classify_kube_error)?;
        debug!(node = name, count = labels.len(), "Node labels updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("nodes \"gpu-1\" {}", reason),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_forbidden_is_permission() {
        let err = classify_kube_error(api_error(403, "Forbidden"));
        assert!(matches!(err, ClusterError::Permission(_)));
        assert!(err.is_fatal());

        let err = classify_kube_error(api_error(401, "Unauthorized"));
        assert!(matches!(err, ClusterError::Permission(_)));
    }

    #[test]
    fn test_not_found_and_server_errors_are_transient() {
        let err = classify_kube_error(api_error(404, "NotFound"));
        assert!(matches!(err, ClusterError::NotFound(_)));
        assert!(err.is_transient());

        let err = classify_kube_error(api_error(503, "ServiceUnavailable"));
        assert!(matches!(err, ClusterError::Api(ref m) if m.contains("503")));
        assert!(err.is_transient());

        let err = classify_kube_error(api_error(409, "Conflict"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_node_state_projection() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("gpu-1".to_string()),
                labels: Some(BTreeMap::from([(
                    "gnsa.io/score".to_string(),
                    "0.500000".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let state = node_state(&node);
        assert_eq!(state.name, "gpu-1");
        assert!(state.unschedulable);
        assert_eq!(state.labels.len(), 1);

        let bare = node_state(&Node::default());
        assert!(!bare.unschedulable);
        assert!(bare.labels.is_empty());
    }
}
