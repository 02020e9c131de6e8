//! Mock ClusterClient for unit testing
//!
//! In-memory object store that behaves like the API server where the
//! controller depends on it: resource versions with conflict detection,
//! finalizer-aware deletion, owner-reference cascade on devbox removal, and
//! NodePort allocation. Faults (quota, status conflicts) can be injected, and
//! pods can be held in a terminating state across passes.

use crate::client::object_key;
use crate::cluster_trait::{ClusterClientTrait, Labels};
use crate::error::ClusterError;
use chrono::SecondsFormat;
use crds::{Devbox, DevboxSpec, Runtime};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod, PodStatus, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn now() -> Option<Time> {
    let stamp = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(stamp)).ok()
}

fn labels_match<K: Resource>(obj: &K, labels: &Labels) -> bool {
    let have = obj.meta().labels.as_ref();
    labels
        .iter()
        .all(|(k, v)| have.and_then(|l| l.get(k)) == Some(v))
}

fn has_finalizers<K: Resource>(obj: &K) -> bool {
    obj.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

fn is_owned_by<K: Resource>(obj: &K, uid: &str) -> bool {
    obj.meta()
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
}

enum Deleted {
    Absent,
    Marked,
    Removed,
}

#[derive(Default)]
struct Store {
    devboxes: BTreeMap<Key, Devbox>,
    runtimes: BTreeMap<Key, Runtime>,
    secrets: BTreeMap<Key, Secret>,
    pods: BTreeMap<Key, Pod>,
    services: BTreeMap<Key, Service>,
    deployments: BTreeMap<Key, Deployment>,
    ingresses: BTreeMap<Key, Ingress>,
    resource_version: u64,
    next_node_port: i32,
    allocate_node_ports: bool,
    quota_exceeded: bool,
    hold_terminating_pods: bool,
    status_conflicts: u32,
    writes: usize,
}

impl Store {
    fn next_rv(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn insert_new<K: Resource + Clone>(
        map: &mut BTreeMap<Key, K>,
        mut obj: K,
        rv: String,
    ) -> Result<K, ClusterError> {
        let key = object_key(&obj)?;
        if map.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!("{}/{}", key.0, key.1)));
        }
        let meta = obj.meta_mut();
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(rv);
        meta.creation_timestamp = now();
        meta.deletion_timestamp = None;
        map.insert(key, obj.clone());
        Ok(obj)
    }

    /// Replaces an existing object after a resourceVersion check. `merge`
    /// receives the stored object and the incoming one and builds the result.
    /// An object that is being deleted and has lost its last finalizer is
    /// removed; its uid is returned alongside so owners can cascade.
    fn replace_existing<K: Resource + Clone>(
        map: &mut BTreeMap<Key, K>,
        obj: &K,
        rv: String,
        merge: impl FnOnce(&K, K) -> K,
    ) -> Result<(K, Option<String>), ClusterError> {
        let key = object_key(obj)?;
        let existing = map
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound(format!("{}/{}", key.0, key.1)))?;
        if let Some(incoming) = obj.meta().resource_version.as_deref() {
            if existing.meta().resource_version.as_deref() != Some(incoming) {
                return Err(ClusterError::Conflict(format!(
                    "{}/{}: the object has been modified",
                    key.0, key.1
                )));
            }
        }

        let mut updated = merge(existing, obj.clone());
        {
            let old = existing.meta();
            let meta = updated.meta_mut();
            meta.uid.clone_from(&old.uid);
            meta.creation_timestamp.clone_from(&old.creation_timestamp);
            meta.deletion_timestamp.clone_from(&old.deletion_timestamp);
            meta.resource_version = Some(rv);
        }

        if updated.meta().deletion_timestamp.is_some() && !has_finalizers(&updated) {
            map.remove(&key);
            let uid = updated.meta().uid.clone();
            return Ok((updated, uid));
        }
        map.insert(key, updated.clone());
        Ok((updated, None))
    }

    fn delete_entry<K: Resource>(map: &mut BTreeMap<Key, K>, key: &Key, rv: String) -> Deleted {
        let Some(obj) = map.get_mut(key) else {
            return Deleted::Absent;
        };
        if has_finalizers(obj) {
            let meta = obj.meta_mut();
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = now();
                meta.resource_version = Some(rv);
            }
            return Deleted::Marked;
        }
        map.remove(key);
        Deleted::Removed
    }

    fn owned_keys<K: Resource>(map: &BTreeMap<Key, K>, uid: &str) -> Vec<Key> {
        map.iter()
            .filter(|(_, obj)| is_owned_by(*obj, uid))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Garbage collection of everything owned by a removed devbox
    fn cascade(&mut self, uid: &str) {
        for key in Self::owned_keys(&self.pods, uid) {
            let rv = self.next_rv();
            Self::delete_entry(&mut self.pods, &key, rv);
        }
        for key in Self::owned_keys(&self.secrets, uid) {
            let rv = self.next_rv();
            Self::delete_entry(&mut self.secrets, &key, rv);
        }
        for key in Self::owned_keys(&self.services, uid) {
            let rv = self.next_rv();
            Self::delete_entry(&mut self.services, &key, rv);
        }
        for key in Self::owned_keys(&self.deployments, uid) {
            let rv = self.next_rv();
            Self::delete_entry(&mut self.deployments, &key, rv);
        }
        for key in Self::owned_keys(&self.ingresses, uid) {
            let rv = self.next_rv();
            Self::delete_entry(&mut self.ingresses, &key, rv);
        }
    }

    fn allocate_node_ports(&mut self, service: &mut Service) {
        if !self.allocate_node_ports {
            return;
        }
        let Some(spec) = service.spec.as_mut() else {
            return;
        };
        if spec.type_.as_deref() != Some("NodePort") {
            return;
        }
        for port in spec.ports.iter_mut().flatten() {
            if port.node_port.unwrap_or(0) == 0 {
                port.node_port = Some(self.next_node_port);
                self.next_node_port += 1;
            }
        }
    }
}

/// Mock ClusterClient for testing
///
/// Clones share the same store, so a test can hand one clone to the
/// reconciler and keep another for setup and assertions.
#[derive(Clone)]
pub struct MockClusterClient {
    store: Arc<Mutex<Store>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl Default for MockClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClusterClient {
    /// Create an empty store that allocates node ports from 30000
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store {
                next_node_port: 30000,
                allocate_node_ports: true,
                ..Store::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Test setup

    /// Add a devbox to the mock store (for test setup)
    pub fn add_devbox(&self, devbox: Devbox) -> Devbox {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        Store::insert_new(&mut store.devboxes, devbox.clone(), rv).unwrap_or(devbox)
    }

    /// Add a runtime to the mock store (for test setup)
    pub fn add_runtime(&self, runtime: Runtime) {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let _ = Store::insert_new(&mut store.runtimes, runtime, rv);
    }

    /// Add a secret to the mock store (for test setup)
    pub fn add_secret(&self, secret: Secret) {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let _ = Store::insert_new(&mut store.secrets, secret, rv);
    }

    /// Add a pod to the mock store (for test setup)
    pub fn add_pod(&self, pod: Pod) {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let _ = Store::insert_new(&mut store.pods, pod, rv);
    }

    /// Add a service to the mock store (for test setup)
    pub fn add_service(&self, mut service: Service) {
        let store = &mut *self.lock();
        store.allocate_node_ports(&mut service);
        let rv = store.next_rv();
        let _ = Store::insert_new(&mut store.services, service, rv);
    }

    /// Simulate a tenant edit of the devbox spec
    pub fn edit_devbox_spec(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut DevboxSpec)) {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        if let Some(devbox) = store.devboxes.get_mut(&key(namespace, name)) {
            edit(&mut devbox.spec);
            devbox.metadata.resource_version = Some(rv);
        }
    }

    /// Simulate a tenant deleting the devbox
    pub fn request_devbox_deletion(&self, namespace: &str, name: &str) {
        let store = &mut *self.lock();
        let k = key(namespace, name);
        let uid = store.devboxes.get(&k).and_then(|d| d.metadata.uid.clone());
        let rv = store.next_rv();
        if let Deleted::Removed = Store::delete_entry(&mut store.devboxes, &k, rv) {
            if let Some(uid) = uid {
                store.cascade(&uid);
            }
        }
    }

    /// Overwrite the pod phase as the node agent would
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str) {
        self.with_pod_status(namespace, name, |status| {
            status.phase = Some(phase.to_string());
        });
    }

    /// Overwrite the state of the pod's first container
    pub fn set_pod_container_state(&self, namespace: &str, name: &str, state: ContainerState) {
        self.with_pod_status(namespace, name, |status| {
            let statuses = status.container_statuses.get_or_insert_with(Vec::new);
            if statuses.is_empty() {
                statuses.push(ContainerStatus {
                    name: "devbox".to_string(),
                    ..ContainerStatus::default()
                });
            }
            statuses[0].state = Some(state);
        });
    }

    /// Record the node the pod was scheduled on
    pub fn set_pod_node(&self, namespace: &str, name: &str, node: &str) {
        let store = &mut *self.lock();
        if let Some(pod) = store.pods.get_mut(&key(namespace, name)) {
            pod.spec.get_or_insert_with(Default::default).node_name = Some(node.to_string());
        }
    }

    fn with_pod_status(&self, namespace: &str, name: &str, f: impl FnOnce(&mut PodStatus)) {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        if let Some(pod) = store.pods.get_mut(&key(namespace, name)) {
            f(pod.status.get_or_insert_with(PodStatus::default));
            pod.metadata.resource_version = Some(rv);
        }
    }

    /// Make pod creation fail with a quota error
    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.lock().quota_exceeded = exceeded;
    }

    /// Fail the next `count` status updates with a conflict, as if another
    /// writer had updated the devbox in between
    pub fn fail_next_status_updates(&self, count: u32) {
        self.lock().status_conflicts = count;
    }

    /// Keep deleted pods listed with a deletion timestamp until
    /// `finish_pod_termination`, the way the kubelet holds a pod during its
    /// grace period
    pub fn set_hold_terminating_pods(&self, hold: bool) {
        self.lock().hold_terminating_pods = hold;
    }

    /// End the grace period of every terminating pod in the namespace
    pub fn finish_pod_termination(&self, namespace: &str) {
        self.lock()
            .pods
            .retain(|(ns, _), pod| ns != namespace || pod.metadata.deletion_timestamp.is_none());
    }

    /// Toggle NodePort allocation (disabled simulates a slow allocator)
    pub fn set_node_port_allocation(&self, enabled: bool) {
        self.lock().allocate_node_ports = enabled;
    }

    // Assertions

    /// Number of successful mutating calls made through the trait
    #[must_use]
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    #[must_use]
    pub fn devbox(&self, namespace: &str, name: &str) -> Option<Devbox> {
        self.lock().devboxes.get(&key(namespace, name)).cloned()
    }

    #[must_use]
    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        self.lock()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect()
    }

    #[must_use]
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock().secrets.get(&key(namespace, name)).cloned()
    }

    #[must_use]
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.lock().services.get(&key(namespace, name)).cloned()
    }

    #[must_use]
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.lock().deployments.get(&key(namespace, name)).cloned()
    }

    #[must_use]
    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.lock().ingresses.get(&key(namespace, name)).cloned()
    }

    /// Total number of stored objects of the kinds the controller owns
    #[must_use]
    pub fn owned_object_count(&self, namespace: &str) -> usize {
        let store = self.lock();
        let in_ns = |k: &Key| k.0 == namespace;
        store.pods.keys().filter(|k| in_ns(k)).count()
            + store.secrets.keys().filter(|k| in_ns(k)).count()
            + store.services.keys().filter(|k| in_ns(k)).count()
            + store.deployments.keys().filter(|k| in_ns(k)).count()
            + store.ingresses.keys().filter(|k| in_ns(k)).count()
    }
}

fn list_in<K: Resource + Clone>(map: &BTreeMap<Key, K>, namespace: &str, labels: &Labels) -> Vec<K> {
    map.iter()
        .filter(|((ns, _), obj)| ns == namespace && labels_match(*obj, labels))
        .map(|(_, obj)| obj.clone())
        .collect()
}

fn take_incoming<K>(_: &K, incoming: K) -> K {
    incoming
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_devbox(&self, namespace: &str, name: &str) -> Result<Option<Devbox>, ClusterError> {
        Ok(self.devbox(namespace, name))
    }

    async fn update_devbox(&self, devbox: &Devbox) -> Result<Devbox, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let (updated, removed) = Store::replace_existing(&mut store.devboxes, devbox, rv, |old, mut new| {
            new.status.clone_from(&old.status);
            new
        })?;
        if let Some(uid) = removed {
            store.cascade(&uid);
        }
        store.writes += 1;
        Ok(updated)
    }

    async fn update_devbox_status(&self, devbox: &Devbox) -> Result<Devbox, ClusterError> {
        let store = &mut *self.lock();
        if store.status_conflicts > 0 {
            store.status_conflicts -= 1;
            let rv = store.next_rv();
            let k = object_key(devbox)?;
            if let Some(stored) = store.devboxes.get_mut(&k) {
                stored.metadata.resource_version = Some(rv);
            }
            return Err(ClusterError::Conflict(format!("{}/{}: injected conflict", k.0, k.1)));
        }
        let rv = store.next_rv();
        let (updated, _) = Store::replace_existing(&mut store.devboxes, devbox, rv, |old, new| {
            let mut merged = old.clone();
            merged.status = new.status;
            merged
        })?;
        store.writes += 1;
        Ok(updated)
    }

    async fn get_runtime(&self, namespace: &str, name: &str) -> Result<Option<Runtime>, ClusterError> {
        Ok(self.lock().runtimes.get(&key(namespace, name)).cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ClusterError> {
        Ok(self.secret(namespace, name))
    }

    async fn list_secrets(&self, namespace: &str, labels: &Labels) -> Result<Vec<Secret>, ClusterError> {
        Ok(list_in(&self.lock().secrets, namespace, labels))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let created = Store::insert_new(&mut store.secrets, secret.clone(), rv)?;
        store.writes += 1;
        Ok(created)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let (updated, _) = Store::replace_existing(&mut store.secrets, secret, rv, take_incoming)?;
        store.writes += 1;
        Ok(updated)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let deleted = !matches!(
            Store::delete_entry(&mut store.secrets, &key(namespace, name), rv),
            Deleted::Absent
        );
        if deleted {
            store.writes += 1;
        }
        Ok(deleted)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        Ok(self.lock().pods.get(&key(namespace, name)).cloned())
    }

    async fn list_pods(&self, namespace: &str, labels: &Labels) -> Result<Vec<Pod>, ClusterError> {
        Ok(list_in(&self.lock().pods, namespace, labels))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let store = &mut *self.lock();
        if store.quota_exceeded {
            return Err(ClusterError::QuotaExceeded(
                "pods is forbidden: exceeded quota: tenant-quota".to_string(),
            ));
        }
        let rv = store.next_rv();
        let mut pod = pod.clone();
        pod.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..PodStatus::default()
        });
        let created = Store::insert_new(&mut store.pods, pod, rv)?;
        store.writes += 1;
        Ok(created)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let (updated, removed) = Store::replace_existing(&mut store.pods, pod, rv, |old, mut new| {
            new.status.clone_from(&old.status);
            new
        })?;
        if removed.is_some() && store.hold_terminating_pods {
            store.pods.insert(object_key(&updated)?, updated.clone());
        }
        store.writes += 1;
        Ok(updated)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        if store.hold_terminating_pods {
            let Some(pod) = store.pods.get_mut(&key(namespace, name)) else {
                return Ok(false);
            };
            if pod.metadata.deletion_timestamp.is_none() {
                pod.metadata.deletion_timestamp = now();
                pod.metadata.resource_version = Some(rv);
            }
            store.writes += 1;
            return Ok(true);
        }
        let deleted = !matches!(
            Store::delete_entry(&mut store.pods, &key(namespace, name), rv),
            Deleted::Absent
        );
        if deleted {
            store.writes += 1;
        }
        Ok(deleted)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, ClusterError> {
        Ok(self.service(namespace, name))
    }

    async fn list_services(&self, namespace: &str, labels: &Labels) -> Result<Vec<Service>, ClusterError> {
        Ok(list_in(&self.lock().services, namespace, labels))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ClusterError> {
        let store = &mut *self.lock();
        let mut service = service.clone();
        store.allocate_node_ports(&mut service);
        let rv = store.next_rv();
        let created = Store::insert_new(&mut store.services, service, rv)?;
        store.writes += 1;
        Ok(created)
    }

    async fn update_service(&self, service: &Service) -> Result<Service, ClusterError> {
        let store = &mut *self.lock();
        let mut service = service.clone();
        store.allocate_node_ports(&mut service);
        let rv = store.next_rv();
        let (updated, _) = Store::replace_existing(&mut store.services, &service, rv, take_incoming)?;
        store.writes += 1;
        Ok(updated)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let deleted = !matches!(
            Store::delete_entry(&mut store.services, &key(namespace, name), rv),
            Deleted::Absent
        );
        if deleted {
            store.writes += 1;
        }
        Ok(deleted)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, ClusterError> {
        Ok(self.deployment(namespace, name))
    }

    async fn list_deployments(&self, namespace: &str, labels: &Labels) -> Result<Vec<Deployment>, ClusterError> {
        Ok(list_in(&self.lock().deployments, namespace, labels))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let created = Store::insert_new(&mut store.deployments, deployment.clone(), rv)?;
        store.writes += 1;
        Ok(created)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let (updated, _) = Store::replace_existing(&mut store.deployments, deployment, rv, take_incoming)?;
        store.writes += 1;
        Ok(updated)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let deleted = !matches!(
            Store::delete_entry(&mut store.deployments, &key(namespace, name), rv),
            Deleted::Absent
        );
        if deleted {
            store.writes += 1;
        }
        Ok(deleted)
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, ClusterError> {
        Ok(self.ingress(namespace, name))
    }

    async fn list_ingresses(&self, namespace: &str, labels: &Labels) -> Result<Vec<Ingress>, ClusterError> {
        Ok(list_in(&self.lock().ingresses, namespace, labels))
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let created = Store::insert_new(&mut store.ingresses, ingress.clone(), rv)?;
        store.writes += 1;
        Ok(created)
    }

    async fn update_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let (updated, _) = Store::replace_existing(&mut store.ingresses, ingress, rv, take_incoming)?;
        store.writes += 1;
        Ok(updated)
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        let store = &mut *self.lock();
        let rv = store.next_rv();
        let deleted = !matches!(
            Store::delete_entry(&mut store.ingresses, &key(namespace, name), rv),
            Deleted::Absent
        );
        if deleted {
            store.writes += 1;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    fn meta(name: &str, finalizers: Option<Vec<String>>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("ns".to_string()),
            finalizers,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let mock = MockClusterClient::new();
        let created = mock
            .create_secret(&Secret {
                metadata: meta("s", None),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut first = created.clone();
        first.string_data = Some(BTreeMap::from([("a".to_string(), "1".to_string())]));
        mock.update_secret(&first).await.unwrap();

        // Second writer still holds the original resourceVersion
        let err = mock.update_secret(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_with_finalizer_marks_then_update_removes() {
        let mock = MockClusterClient::new();
        mock.create_pod(&Pod {
            metadata: meta("p", Some(vec!["keep".to_string()])),
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(mock.delete_pod("ns", "p").await.unwrap());
        let mut pod = mock.pods("ns").remove(0);
        assert!(pod.metadata.deletion_timestamp.is_some());

        pod.metadata.finalizers = None;
        mock.update_pod(&pod).await.unwrap();
        assert!(mock.pods("ns").is_empty());

        // Deleting an absent object is not an error
        assert!(!mock.delete_pod("ns", "p").await.unwrap());
    }

    #[tokio::test]
    async fn test_held_pod_stays_terminating() {
        let mock = MockClusterClient::new();
        mock.set_hold_terminating_pods(true);
        mock.create_pod(&Pod {
            metadata: meta("p", Some(vec!["keep".to_string()])),
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(mock.delete_pod("ns", "p").await.unwrap());
        let mut pod = mock.pods("ns").remove(0);
        pod.metadata.finalizers = None;
        mock.update_pod(&pod).await.unwrap();

        let pods = mock.pods("ns");
        assert_eq!(pods.len(), 1);
        assert!(pods[0].metadata.deletion_timestamp.is_some());

        mock.finish_pod_termination("ns");
        assert!(mock.pods("ns").is_empty());
    }

    #[tokio::test]
    async fn test_node_port_allocation() {
        let mock = MockClusterClient::new();
        let svc = Service {
            metadata: meta("svc", None),
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                ports: Some(vec![ServicePort {
                    port: 22,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = mock.create_service(&svc).await.unwrap();
        let ports = created.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].node_port, Some(30000));

        mock.set_node_port_allocation(false);
        let other = Service {
            metadata: meta("other", None),
            ..svc
        };
        let created = mock.create_service(&other).await.unwrap();
        assert_eq!(created.spec.unwrap().ports.unwrap()[0].node_port, None);
    }

    #[tokio::test]
    async fn test_quota_injection() {
        let mock = MockClusterClient::new();
        mock.set_quota_exceeded(true);

        let err = mock
            .create_pod(&Pod {
                metadata: meta("p", None),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(mock.writes(), 0);
    }
}
