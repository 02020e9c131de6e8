//! ClusterClient trait for mocking
//!
//! This trait abstracts the object store the devbox controller reads and
//! writes. The kube-backed `KubeClusterClient` implements it for production;
//! tests use the in-memory `MockClusterClient`.

use crate::error::ClusterError;
use crds::{Devbox, Runtime};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeMap;

/// Label set used as an equality-based selector
pub type Labels = BTreeMap<String, String>;

/// Trait for cluster object-store operations
///
/// Every call is a single bounded request. `get_*` returns `None` for absent
/// objects, `delete_*` returns `false` when there was nothing to delete, and
/// `update_*` carries the object's `resourceVersion` so stale writes fail with
/// `ClusterError::Conflict`.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    // Devbox
    async fn get_devbox(&self, namespace: &str, name: &str) -> Result<Option<Devbox>, ClusterError>;
    /// Replaces metadata and spec; status is ignored
    async fn update_devbox(&self, devbox: &Devbox) -> Result<Devbox, ClusterError>;
    /// Replaces the status subresource only
    async fn update_devbox_status(&self, devbox: &Devbox) -> Result<Devbox, ClusterError>;

    // Runtime
    async fn get_runtime(&self, namespace: &str, name: &str) -> Result<Option<Runtime>, ClusterError>;

    // Secrets
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ClusterError>;
    async fn list_secrets(&self, namespace: &str, labels: &Labels) -> Result<Vec<Secret>, ClusterError>;
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError>;
    async fn update_secret(&self, secret: &Secret) -> Result<Secret, ClusterError>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;

    // Pods
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError>;
    async fn list_pods(&self, namespace: &str, labels: &Labels) -> Result<Vec<Pod>, ClusterError>;
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;
    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;

    // Services
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, ClusterError>;
    async fn list_services(&self, namespace: &str, labels: &Labels) -> Result<Vec<Service>, ClusterError>;
    async fn create_service(&self, service: &Service) -> Result<Service, ClusterError>;
    async fn update_service(&self, service: &Service) -> Result<Service, ClusterError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;

    // Deployments
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, ClusterError>;
    async fn list_deployments(&self, namespace: &str, labels: &Labels) -> Result<Vec<Deployment>, ClusterError>;
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError>;
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;

    // Ingresses
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, ClusterError>;
    async fn list_ingresses(&self, namespace: &str, labels: &Labels) -> Result<Vec<Ingress>, ClusterError>;
    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClusterError>;
    async fn update_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClusterError>;
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;
}
