//! GNSA Kubernetes Integration
//!
//! Implements the core `ClusterApi` seam against the Kubernetes API server.

pub mod client;
pub mod cluster;

pub use client::K8sClient;
pub use cluster::{classify_kube_error, node_state};
