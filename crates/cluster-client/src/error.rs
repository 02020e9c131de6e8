//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the cluster object store
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Any Kubernetes API error not classified below
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object with the same name already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Write lost an optimistic-concurrency race (stale resourceVersion)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Namespace resource quota rejected the create
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Object is missing the identity needed for the call
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists(ae.message.clone())
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 403 && ae.message.contains("exceeded quota") => {
                Self::QuotaExceeded(ae.message.clone())
            }
            _ => Self::Kube(err),
        }
    }
}
