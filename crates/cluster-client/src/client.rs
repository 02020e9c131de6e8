//! Kubernetes-backed implementation of `ClusterClientTrait`.

use crate::cluster_trait::{ClusterClientTrait, Labels};
use crate::error::ClusterError;
use chrono::{DateTime, Utc};
use crds::{Devbox, Runtime};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

/// Renders a label set as an equality-based selector (`a=b,c=d`)
#[must_use]
pub fn label_selector(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Creation time the API server stamped on an object
#[must_use]
pub fn creation_time<K: Resource>(obj: &K) -> Option<DateTime<Utc>> {
    let stamp = serde_json::to_value(obj.meta().creation_timestamp.as_ref()?).ok()?;
    serde_json::from_value(stamp).ok()
}

/// Namespace and name of an object about to be written
pub(crate) fn object_key<K: Resource>(obj: &K) -> Result<(String, String), ClusterError> {
    let meta = obj.meta();
    let name = meta
        .name
        .clone()
        .ok_or_else(|| ClusterError::InvalidObject("object without a name".to_string()))?;
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| ClusterError::InvalidObject(format!("{name} without a namespace")))?;
    Ok((namespace, name))
}

/// Cluster client backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K>(&self, namespace: &str, labels: &Labels) -> Result<Vec<K>, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create<K>(&self, obj: &K) -> Result<K, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let (namespace, name) = object_key(obj)?;
        debug!("Creating {} {}/{}", K::kind(&K::DynamicType::default()), namespace, name);
        Ok(self
            .api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace<K>(&self, obj: &K) -> Result<K, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let (namespace, name) = object_key(obj)?;
        Ok(self
            .api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for KubeClusterClient {
    async fn get_devbox(&self, namespace: &str, name: &str) -> Result<Option<Devbox>, ClusterError> {
        self.get(namespace, name).await
    }

    async fn update_devbox(&self, devbox: &Devbox) -> Result<Devbox, ClusterError> {
        self.replace(devbox).await
    }

    async fn update_devbox_status(&self, devbox: &Devbox) -> Result<Devbox, ClusterError> {
        let (namespace, name) = object_key(devbox)?;
        let data = serde_json::to_vec(devbox)?;
        Ok(self
            .api::<Devbox>(&namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await?)
    }

    async fn get_runtime(&self, namespace: &str, name: &str) -> Result<Option<Runtime>, ClusterError> {
        self.get(namespace, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ClusterError> {
        self.get(namespace, name).await
    }

    async fn list_secrets(&self, namespace: &str, labels: &Labels) -> Result<Vec<Secret>, ClusterError> {
        self.list(namespace, labels).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        self.create(secret).await
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        self.replace(secret).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.delete::<Secret>(namespace, name).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        self.get(namespace, name).await
    }

    async fn list_pods(&self, namespace: &str, labels: &Labels) -> Result<Vec<Pod>, ClusterError> {
        self.list(namespace, labels).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        self.create(pod).await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        self.replace(pod).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.delete::<Pod>(namespace, name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, ClusterError> {
        self.get(namespace, name).await
    }

    async fn list_services(&self, namespace: &str, labels: &Labels) -> Result<Vec<Service>, ClusterError> {
        self.list(namespace, labels).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ClusterError> {
        self.create(service).await
    }

    async fn update_service(&self, service: &Service) -> Result<Service, ClusterError> {
        self.replace(service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.delete::<Service>(namespace, name).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, ClusterError> {
        self.get(namespace, name).await
    }

    async fn list_deployments(&self, namespace: &str, labels: &Labels) -> Result<Vec<Deployment>, ClusterError> {
        self.list(namespace, labels).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        self.create(deployment).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        self.replace(deployment).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.delete::<Deployment>(namespace, name).await
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, ClusterError> {
        self.get(namespace, name).await
    }

    async fn list_ingresses(&self, namespace: &str, labels: &Labels) -> Result<Vec<Ingress>, ClusterError> {
        self.list(namespace, labels).await
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClusterError> {
        self.create(ingress).await
    }

    async fn update_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClusterError> {
        self.replace(ingress).await
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.delete::<Ingress>(namespace, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector() {
        let mut labels = Labels::new();
        labels.insert("app.kubernetes.io/name".to_string(), "box".to_string());
        labels.insert("app.kubernetes.io/part-of".to_string(), "devbox".to_string());

        assert_eq!(
            label_selector(&labels),
            "app.kubernetes.io/name=box,app.kubernetes.io/part-of=devbox"
        );
        assert_eq!(label_selector(&Labels::new()), "");
    }

    #[test]
    fn test_object_key_requires_namespace() {
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("box".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let err = object_key(&secret).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidObject(_)));
    }

    #[test]
    fn test_creation_time() {
        let mut pod = Pod::default();
        assert_eq!(creation_time(&pod), None);

        pod.metadata.creation_timestamp =
            serde_json::from_value(serde_json::Value::String("2024-03-04T05:06:07Z".to_string())).unwrap();
        let expected = DateTime::parse_from_rfc3339("2024-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(creation_time(&pod), Some(expected));
    }
}
