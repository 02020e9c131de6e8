//! Reconciliation logic for Devbox resources.
//!
//! One pass runs the credential, network and pod steps in that order. Each
//! step re-derives desired state from the store, so a pass that fails half
//! way is simply repeated:
//! - `secret`: SSH keypair and shared token
//! - `network`: NodePort service, or websocket gateway plus ingress
//! - `pod`: the single pod generation and its commit history
//! - `cleanup`: removal of everything derived from a deleted devbox

pub mod cleanup;
pub mod commit;
pub mod network;
pub mod pod;
pub mod secret;

#[cfg(test)]
mod secret_test;

use crate::backoff::FibonacciBackoff;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::{EventPublisher, actions, reasons};
use crate::labels::FINALIZER;
use crate::retry::{RetryConfig, retry_on_conflict};
use cluster_client::{ClusterClientTrait, Labels};
use crds::{Devbox, DevboxState, DevboxStatus, Runtime};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use kube::runtime::events::EventType;
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Backoff state for a devbox
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new(max_seconds: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(1, max_seconds),
            error_count: 0,
        }
    }
}

/// Reconciles Devbox resources.
pub struct Reconciler {
    pub(crate) client: Box<dyn ClusterClientTrait>,
    pub(crate) events: Box<dyn EventPublisher>,
    pub(crate) config: Arc<ControllerConfig>,
    pub(crate) retry: RetryConfig,
    /// Error backoff per devbox (namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        client: impl ClusterClientTrait + 'static,
        events: impl EventPublisher + 'static,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            client: Box::new(client),
            events: Box::new(events),
            config,
            retry: RetryConfig::default(),
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Requeue delay for a devbox whose last pass failed
    pub fn next_backoff(&self, key: &str) -> Duration {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let max = self.config.requeue_max_seconds;
                let state = states
                    .entry(key.to_string())
                    .or_insert_with(|| BackoffState::new(max));
                state.error_count += 1;
                let delay = state.backoff.next_backoff();
                debug!(key, error_count = state.error_count, delay_secs = delay.as_secs(), "Backing off");
                delay
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                Duration::from_secs(60)
            }
        }
    }

    /// Forget the error history of a devbox after a successful pass
    pub fn reset_backoff(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(key);
        }
    }

    /// Run one reconciliation pass for the devbox `namespace/name`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action, ControllerError> {
        let Some(devbox) = self.client.get_devbox(namespace, name).await? else {
            debug!(namespace, name, "Devbox not found, nothing to do");
            return Ok(Action::await_change());
        };
        let obj_ref = devbox.object_ref(&());

        if devbox.metadata.deletion_timestamp.is_some() {
            if has_finalizer(&devbox) {
                self.finalize(namespace, name, &obj_ref).await?;
            }
            return Ok(Action::await_change());
        }

        let Some(devbox) = self.ensure_finalizer(namespace, name).await? else {
            return Ok(Action::await_change());
        };

        let network_type = devbox.spec.network_spec.network_type;
        self.update_status(namespace, name, |status| {
            status.network.network_type = network_type;
        })
        .await?;

        debug!(namespace, name, "Syncing secret");
        let result = self.sync_secret(&devbox).await;
        self.record_step(&obj_ref, result, reasons::SYNC_SECRET_SUCCEEDED, reasons::SYNC_SECRET_FAILED)
            .await?;

        debug!(namespace, name, "Syncing network");
        let result = self.sync_network(&devbox).await;
        self.record_step(&obj_ref, result, reasons::SYNC_NETWORK_SUCCEEDED, reasons::SYNC_NETWORK_FAILED)
            .await?;

        debug!(namespace, name, "Syncing pod");
        let result = self.sync_pod(&devbox).await;
        self.record_step(&obj_ref, result, reasons::SYNC_POD_SUCCEEDED, reasons::SYNC_POD_FAILED)
            .await?;

        info!(namespace, name, "Devbox reconciled");
        Ok(Action::await_change())
    }

    async fn record_step(
        &self,
        obj_ref: &ObjectReference,
        result: Result<(), ControllerError>,
        success: &str,
        failure: &str,
    ) -> Result<(), ControllerError> {
        match result {
            Ok(()) => {
                self.events
                    .publish(obj_ref, EventType::Normal, success, actions::RECONCILE, None)
                    .await;
                Ok(())
            }
            Err(e) => {
                error!(
                    namespace = obj_ref.namespace.as_deref().unwrap_or_default(),
                    name = obj_ref.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "{} failed",
                    failure
                );
                self.events
                    .publish(obj_ref, EventType::Warning, failure, actions::RECONCILE, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Remove everything derived from the devbox, then release it
    async fn finalize(&self, namespace: &str, name: &str, obj_ref: &ObjectReference) -> Result<(), ControllerError> {
        info!(namespace, name, "Devbox deleted, removing owned resources");
        if let Err(e) = self.remove_all(namespace, name).await {
            error!(namespace, name, error = %e, "Cleanup failed");
            self.events
                .publish(
                    obj_ref,
                    EventType::Warning,
                    reasons::CLEANUP_FAILED,
                    actions::DELETE,
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }

        self.update_devbox(namespace, name, |devbox| {
            let Some(finalizers) = devbox.metadata.finalizers.as_mut() else {
                return false;
            };
            let before = finalizers.len();
            finalizers.retain(|f| f != FINALIZER);
            finalizers.len() != before
        })
        .await?;

        info!(namespace, name, "Finalizer removed");
        self.events
            .publish(obj_ref, EventType::Normal, reasons::DELETED, actions::DELETE, None)
            .await;
        Ok(())
    }

    async fn ensure_finalizer(&self, namespace: &str, name: &str) -> Result<Option<Devbox>, ControllerError> {
        self.update_devbox(namespace, name, |devbox| {
            if has_finalizer(devbox) {
                return false;
            }
            devbox
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(FINALIZER.to_string());
            true
        })
        .await
    }

    /// Read-modify-write of the devbox object (metadata and spec). `mutate`
    /// returns whether it changed anything; unchanged objects are not written.
    pub(crate) async fn update_devbox<F>(
        &self,
        namespace: &str,
        name: &str,
        mutate: F,
    ) -> Result<Option<Devbox>, ControllerError>
    where
        F: Fn(&mut Devbox) -> bool + Sync,
    {
        let mutate = &mutate;
        retry_on_conflict(&self.retry, "update devbox", || async move {
            let Some(mut devbox) = self.client.get_devbox(namespace, name).await? else {
                return Ok(None);
            };
            if !mutate(&mut devbox) {
                return Ok(Some(devbox));
            }
            let updated = self.client.update_devbox(&devbox).await?;
            Ok::<_, ControllerError>(Some(updated))
        })
        .await
    }

    /// Read-modify-write of the status subresource against the latest copy
    pub(crate) async fn update_status<F>(&self, namespace: &str, name: &str, mutate: F) -> Result<(), ControllerError>
    where
        F: Fn(&mut DevboxStatus) + Sync,
    {
        let mutate = &mutate;
        retry_on_conflict(&self.retry, "update devbox status", || async move {
            let Some(mut devbox) = self.client.get_devbox(namespace, name).await? else {
                return Ok(());
            };
            let before = devbox.status.clone();
            mutate(devbox.status.get_or_insert_with(DevboxStatus::default));
            if devbox.status == before {
                return Ok(());
            }
            self.client.update_devbox_status(&devbox).await?;
            Ok::<_, ControllerError>(())
        })
        .await
    }

    /// Degrade a devbox to Stopped
    pub(crate) async fn force_stopped(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        self.update_devbox(namespace, name, |devbox| {
            if devbox.spec.state == DevboxState::Stopped {
                return false;
            }
            devbox.spec.state = DevboxState::Stopped;
            true
        })
        .await?;
        Ok(())
    }

    /// Clear the devbox finalizer from a pod, re-reading it on conflict
    pub(crate) async fn remove_pod_finalizer(&self, namespace: &str, pod_name: &str) -> Result<(), ControllerError> {
        retry_on_conflict(&self.retry, "remove pod finalizer", || async move {
            let Some(mut pod) = self.client.get_pod(namespace, pod_name).await? else {
                return Ok(());
            };
            let Some(finalizers) = pod.metadata.finalizers.as_mut() else {
                return Ok(());
            };
            let before = finalizers.len();
            finalizers.retain(|f| f != FINALIZER);
            if finalizers.len() == before {
                return Ok(());
            }
            self.client.update_pod(&pod).await?;
            Ok::<_, ControllerError>(())
        })
        .await
    }

    pub(crate) async fn get_runtime(&self, devbox: &Devbox) -> Result<Runtime, ControllerError> {
        let namespace = devbox.runtime_namespace().unwrap_or_default();
        let name = &devbox.spec.runtime_ref.name;
        self.client
            .get_runtime(&namespace, name)
            .await?
            .ok_or_else(|| ControllerError::RuntimeNotFound(format!("{namespace}/{name}")))
    }
}

pub(crate) fn has_finalizer(devbox: &Devbox) -> bool {
    devbox.finalizers().iter().any(|f| f == FINALIZER)
}

/// Namespace and name of a devbox
pub(crate) fn devbox_key(devbox: &Devbox) -> (String, String) {
    (devbox.namespace().unwrap_or_default(), devbox.name_any())
}

/// Metadata of an object derived from the devbox, owned by it
pub(crate) fn child_meta(devbox: &Devbox, name: String, labels: Labels) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: devbox.namespace(),
        labels: Some(labels),
        owner_references: Some(owner_references(devbox)),
        ..Default::default()
    }
}

pub(crate) fn owner_references(devbox: &Devbox) -> Vec<OwnerReference> {
    devbox.controller_owner_ref(&()).into_iter().collect()
}
