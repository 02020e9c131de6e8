//! Kubernetes Event recording.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so reconciler tests
//! can capture events. Publishing is fire-and-forget: a failed event is logged
//! and never fails a reconciliation pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Trait for publishing Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event about `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventPublisher").finish_non_exhaustive()
    }
}

impl KubeEventPublisher {
    /// `controller_name` is reported as the event's reporting component
    #[must_use]
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    pub const SYNC_SECRET_SUCCEEDED: &str = "SyncSecretSucceeded";
    pub const SYNC_SECRET_FAILED: &str = "SyncSecretFailed";
    pub const SYNC_NETWORK_SUCCEEDED: &str = "SyncNetworkSucceeded";
    pub const SYNC_NETWORK_FAILED: &str = "SyncNetworkFailed";
    pub const SYNC_POD_SUCCEEDED: &str = "SyncPodSucceeded";
    pub const SYNC_POD_FAILED: &str = "SyncPodFailed";
    /// Pod creation rejected by the namespace quota; devbox forced to Stopped
    pub const QUOTA_EXCEEDED: &str = "QuotaExceeded";
    pub const CLEANUP_FAILED: &str = "CleanupFailed";
    pub const DELETED: &str = "Deleted";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const CREATE_POD: &str = "CreatePod";
    pub const DELETE: &str = "Delete";
}

/// Event captured by `RecordingEventPublisher`
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

/// Test implementation that keeps every published event
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct RecordingEventPublisher {
    events: std::sync::Arc<std::sync::Mutex<Vec<RecordedEvent>>>,
}

#[cfg(test)]
impl RecordingEventPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn warnings(&self) -> Vec<RecordedEvent> {
        self.events().into_iter().filter(|e| e.warning).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_publisher_keeps_order() {
        let publisher = RecordingEventPublisher::default();
        let obj_ref = ObjectReference::default();

        publisher
            .publish(&obj_ref, EventType::Normal, reasons::SYNC_SECRET_SUCCEEDED, actions::RECONCILE, None)
            .await;
        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::QUOTA_EXCEEDED,
                actions::CREATE_POD,
                Some("exceeded quota".to_string()),
            )
            .await;

        assert_eq!(publisher.reasons(), vec!["SyncSecretSucceeded", "QuotaExceeded"]);
        assert_eq!(publisher.warnings().len(), 1);
    }
}
