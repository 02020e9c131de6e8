//! Removal of everything derived from a deleted devbox.
//!
//! Safe to re-run after a partial attempt: deleting an absent object is not
//! an error. Gateway objects are enumerated by their own label set so cleanup
//! does not depend on owner-reference cascade.

use super::Reconciler;
use crate::error::ControllerError;
use crate::labels::{proxy_labels, recommended_labels};
use kube::ResourceExt;
use tracing::{debug, info};

impl Reconciler {
    /// Delete the pods, services, secrets, gateway deployments and ingresses
    /// of the devbox `namespace/name`
    pub(crate) async fn remove_all(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let labels = recommended_labels(name);

        // Pods hold our finalizer; release them first or deletion would hang
        for pod in self.client.list_pods(namespace, &labels).await? {
            let pod_name = pod.name_any();
            self.remove_pod_finalizer(namespace, &pod_name).await?;
            if self.client.delete_pod(namespace, &pod_name).await? {
                debug!(namespace, pod = %pod_name, "Deleted pod");
            }
        }
        for service in self.client.list_services(namespace, &labels).await? {
            self.client.delete_service(namespace, &service.name_any()).await?;
        }
        for secret in self.client.list_secrets(namespace, &labels).await? {
            self.client.delete_secret(namespace, &secret.name_any()).await?;
        }

        let proxy = proxy_labels(name);
        for deployment in self.client.list_deployments(namespace, &proxy).await? {
            self.client.delete_deployment(namespace, &deployment.name_any()).await?;
        }
        for service in self.client.list_services(namespace, &proxy).await? {
            self.client.delete_service(namespace, &service.name_any()).await?;
        }
        for ingress in self.client.list_ingresses(namespace, &proxy).await? {
            self.client.delete_ingress(namespace, &ingress.name_any()).await?;
        }

        info!(namespace, name, "Removed resources of deleted devbox");
        Ok(())
    }
}
