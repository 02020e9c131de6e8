//! Controller-specific error types.
//!
//! This module defines error types specific to the Devbox Controller
//! that are not covered by upstream library errors.

use cluster_client::ClusterError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Devbox Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Object store error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Referenced Runtime does not exist
    #[error("Runtime not found: {0}")]
    RuntimeNotFound(String),

    /// More than one pod carries the devbox's labels
    #[error("Multiple pods found for devbox {0}")]
    MultiplePods(String),

    /// NodePort service exists but the platform has not assigned a port yet
    #[error("NodePort not allocated for service {0}")]
    NodePortNotAllocated(String),

    /// SSH keypair or token generation failed
    #[error("Credential generation failed: {0}")]
    Credential(String),

    /// Gateway token could not be signed
    #[error("Token signing failed: {0}")]
    Signing(String),

    /// WebSocket mode requested without a gateway image
    #[error("WEBSOCKET_IMAGE is not configured")]
    MissingProxyImage,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Devbox or runtime carries values the controller cannot use
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registration or probe server failure
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl ControllerError {
    /// Whether the error is a lost optimistic-concurrency race
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Cluster(e) if e.is_conflict())
    }

    /// Whether the error is a namespace quota rejection
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::Cluster(e) if e.is_quota_exceeded())
    }

    /// Short label used for metrics
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Kube(_) => "kube",
            Self::Cluster(_) => "cluster",
            Self::RuntimeNotFound(_) => "runtime_not_found",
            Self::MultiplePods(_) => "multiple_pods",
            Self::NodePortNotAllocated(_) => "nodeport_pending",
            Self::Credential(_) => "credential",
            Self::Signing(_) => "signing",
            Self::MissingProxyImage => "missing_proxy_image",
            Self::InvalidConfig(_) => "invalid_config",
            Self::InvalidResource(_) => "invalid_resource",
            Self::Watch(_) => "watch",
            Self::Metrics(_) => "metrics",
        }
    }
}

impl From<prometheus::Error> for ControllerError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
