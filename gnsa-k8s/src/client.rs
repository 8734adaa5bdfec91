//! Kubernetes Client wrapper
//!
//! Provides a simplified interface to the node API.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::info;

/// Field manager recorded on every patch
pub const FIELD_MANAGER: &str = "gnsa";

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new K8s client using in-cluster config (or the local kubeconfig)
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        info!("Connected to Kubernetes API server");
        Ok(Self { client })
    }

    /// Get node API
    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Check if the API server is reachable
    pub async fn health_check(&self) -> Result<()> {
        let _ = self
            .nodes()
            .list(&ListParams::default().limit(1))
            .await
            .context("Failed to list nodes")?;
        Ok(())
    }

    /// Get a node by name
    pub async fn fetch_node(&self, name: &str) -> kube::Result<Node> {
        self.nodes().get(name).await
    }

    /// Cordon a node (mark as unschedulable)
    pub async fn patch_unschedulable(&self, name: &str) -> kube::Result<()> {
        let patch = json!({
            "spec": {
                "unschedulable": true
            }
        });

        self.nodes()
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        info!(node = name, "Node cordoned");
        Ok(())
    }

    /// Merge labels into node metadata
    pub async fn patch_labels(&self, name: &str, labels: &BTreeMap<String, String>) -> kube::Result<()> {
        let patch = json!({
            "metadata": {
                "labels": labels
            }
        });

        self.nodes()
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Delete a node object
    pub async fn remove_node(&self, name: &str) -> kube::Result<()> {
        self.nodes().delete(name, &DeleteParams::default()).await?;
        info!(node = name, "Node deleted");
        Ok(())
    }
}
