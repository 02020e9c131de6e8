//! Commit history bookkeeping.
//!
//! Every pod generation gets one `CommitHistory` entry. The entry starts
//! Pending/Pending, its predicted status follows the container state while the
//! pod is alive, and it is closed when the pod goes away.

use super::pod::COMMIT_IMAGE_ENV;
use crate::credentials::random_suffix;
use crate::labels::COMMIT_IMAGE_ANNOTATION;
use chrono::{DateTime, Utc};
use cluster_client::creation_time;
use crds::{CommitHistory, CommitStatus, DevboxPhase, DevboxState};
use k8s_openapi::api::core::v1::{ContainerState, Pod};
use kube::ResourceExt;

/// Waiting reasons that mean the generation will never start
const FAILED_WAITING_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerError",
    "CreateContainerConfigError",
];

/// Entry for the next pod generation
pub fn new_commit_entry(registry: &str, namespace: &str, devbox_name: &str, now: DateTime<Utc>) -> CommitHistory {
    let tag = format!("{}-{}", random_suffix(5), now.format("%Y-%m-%d-%H%M%S"));
    CommitHistory {
        image: format!("{registry}/{namespace}/{devbox_name}:{tag}"),
        time: now,
        pod: format!("{devbox_name}-{}", random_suffix(5)),
        status: CommitStatus::Pending,
        predicated_status: CommitStatus::Pending,
        node: None,
    }
}

/// State of the pod's first container, if reported
pub fn first_container_state(pod: &Pod) -> Option<ContainerState> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .clone()
}

/// Commit outcome implied by a container state
pub fn predicted_status(state: Option<&ContainerState>) -> CommitStatus {
    let Some(state) = state else {
        return CommitStatus::Pending;
    };
    if let Some(waiting) = &state.waiting {
        let reason = waiting.reason.as_deref().unwrap_or_default();
        if FAILED_WAITING_REASONS.contains(&reason) {
            return CommitStatus::Failed;
        }
    }
    if state.running.is_some() || state.terminated.is_some() {
        return CommitStatus::Success;
    }
    CommitStatus::Pending
}

fn entry_for<'a>(history: &'a mut [CommitHistory], pod_name: &str) -> Option<&'a mut CommitHistory> {
    history.iter_mut().rev().find(|c| c.pod == pod_name)
}

/// Commit image a pod was created with, from its annotation or, failing
/// that, its container env
fn pod_commit_image(pod: &Pod) -> Option<String> {
    if let Some(image) = pod.annotations().get(COMMIT_IMAGE_ANNOTATION) {
        return Some(image.clone());
    }
    pod.spec
        .as_ref()?
        .containers
        .first()?
        .env
        .iter()
        .flatten()
        .find(|e| e.name == COMMIT_IMAGE_ENV)
        .and_then(|e| e.value.clone())
}

/// Open an entry for a pod the history does not know about, e.g. when the
/// status write that should have recorded its creation never landed.
/// Returns whether an entry was added.
pub fn track_pod(history: &mut Vec<CommitHistory>, pod: &Pod) -> bool {
    let Some(pod_name) = pod.metadata.name.as_deref() else {
        return false;
    };
    if history.iter().any(|c| c.pod == pod_name) {
        return false;
    }
    let Some(image) = pod_commit_image(pod) else {
        return false;
    };
    history.push(CommitHistory {
        image,
        time: creation_time(pod).unwrap_or_else(Utc::now),
        pod: pod_name.to_string(),
        status: CommitStatus::Pending,
        predicated_status: CommitStatus::Pending,
        node: None,
    });
    true
}

/// Refresh the predicted status of the pod's entry from its container state
pub fn update_predicated_status(history: &mut [CommitHistory], pod: &Pod) {
    let Some(pod_name) = pod.metadata.name.as_deref() else {
        return;
    };
    let predicted = predicted_status(first_container_state(pod).as_ref());
    if let Some(entry) = entry_for(history, pod_name) {
        entry.predicated_status = predicted;
    }
}

/// Record the node the open generation runs on
pub fn record_node(history: &mut [CommitHistory], pod: &Pod) {
    let Some(pod_name) = pod.metadata.name.as_deref() else {
        return;
    };
    let node = pod.spec.as_ref().and_then(|s| s.node_name.clone());
    if let Some(entry) = entry_for(history, pod_name) {
        if node.is_some() {
            entry.node = node;
        }
    }
}

/// Close the pod's entry: the confirmed status becomes the prediction, and a
/// generation that never got past Pending is confirmed as Failed.
pub fn confirm_commit(history: &mut [CommitHistory], pod_name: &str) {
    if let Some(entry) = entry_for(history, pod_name) {
        entry.status = match entry.predicated_status {
            CommitStatus::Pending => CommitStatus::Failed,
            other => other,
        };
    }
}

/// Merge the working copy into the latest stored history. Entries are keyed
/// by pod name; working entries win, unknown ones are appended in order.
pub fn merge_commit_history(latest: &mut Vec<CommitHistory>, working: &[CommitHistory]) {
    for entry in working {
        match latest.iter_mut().find(|c| c.pod == entry.pod) {
            Some(existing) => *existing = entry.clone(),
            None => latest.push(entry.clone()),
        }
    }
}

/// Image of the most recent successful commit
pub fn last_successful_image(history: &[CommitHistory]) -> Option<&str> {
    history
        .iter()
        .rev()
        .find(|c| c.status == CommitStatus::Success)
        .map(|c| c.image.as_str())
}

/// Phase shown in status for the observed pods
pub fn derive_phase(desired: DevboxState, pods: &[Pod]) -> DevboxPhase {
    match pods {
        [] => match desired {
            DevboxState::Running => DevboxPhase::Pending,
            DevboxState::Stopped => DevboxPhase::Stopped,
        },
        [pod] => {
            if pod.metadata.deletion_timestamp.is_some() || desired == DevboxState::Stopped {
                return DevboxPhase::Stopping;
            }
            match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                Some("Pending") => DevboxPhase::Pending,
                Some("Running") => DevboxPhase::Running,
                Some("Failed") => DevboxPhase::Error,
                Some("Succeeded") => DevboxPhase::Stopped,
                _ => DevboxPhase::Unknown,
            }
        }
        _ => DevboxPhase::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerStateRunning, ContainerStateWaiting, ContainerStatus, PodSpec, PodStatus,
    };
    use kube::api::ObjectMeta;

    fn entry(pod: &str, status: CommitStatus, predicated: CommitStatus) -> CommitHistory {
        CommitHistory {
            image: format!("registry.local/ns/box:{pod}"),
            time: Utc::now(),
            pod: pod.to_string(),
            status,
            predicated_status: predicated,
            node: None,
        }
    }

    fn pod_with(name: &str, phase: &str, state: Option<ContainerState>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: state.map(|s| {
                    vec![ContainerStatus {
                        name: "devbox".to_string(),
                        state: Some(s),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
        }
    }

    fn waiting(reason: &str) -> ContainerState {
        ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.to_string()),
                message: None,
            }),
            ..Default::default()
        }
    }

    fn running() -> ContainerState {
        ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_commit_entry_format() {
        let now = DateTime::parse_from_rfc3339("2024-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        let entry = new_commit_entry("registry.local", "tenant-a", "box", now);

        assert!(entry.image.starts_with("registry.local/tenant-a/box:"));
        assert!(entry.image.ends_with("-2024-03-04-050607"));
        let tag = entry.image.rsplit(':').next().unwrap();
        assert_eq!(tag.len(), 5 + 1 + "2024-03-04-050607".len());
        assert!(entry.pod.starts_with("box-"));
        assert_eq!(entry.pod.len(), "box-".len() + 5);
        assert_eq!(entry.status, CommitStatus::Pending);
        assert_eq!(entry.predicated_status, CommitStatus::Pending);
    }

    #[test]
    fn test_predicted_status() {
        assert_eq!(predicted_status(None), CommitStatus::Pending);
        assert_eq!(predicted_status(Some(&waiting("ImagePullBackOff"))), CommitStatus::Failed);
        assert_eq!(predicted_status(Some(&waiting("CreateContainerError"))), CommitStatus::Failed);
        assert_eq!(predicted_status(Some(&waiting("ContainerCreating"))), CommitStatus::Pending);
        assert_eq!(predicted_status(Some(&running())), CommitStatus::Success);
    }

    #[test]
    fn test_confirm_commit_never_leaves_pending() {
        let mut history = vec![
            entry("box-aaaaa", CommitStatus::Pending, CommitStatus::Success),
            entry("box-bbbbb", CommitStatus::Pending, CommitStatus::Pending),
        ];

        confirm_commit(&mut history, "box-aaaaa");
        confirm_commit(&mut history, "box-bbbbb");

        assert_eq!(history[0].status, CommitStatus::Success);
        assert_eq!(history[1].status, CommitStatus::Failed);
    }

    #[test]
    fn test_update_predicated_status_and_node() {
        let mut history = vec![entry("box-aaaaa", CommitStatus::Pending, CommitStatus::Pending)];
        let pod = pod_with("box-aaaaa", "Running", Some(running()));

        update_predicated_status(&mut history, &pod);
        record_node(&mut history, &pod);

        assert_eq!(history[0].predicated_status, CommitStatus::Success);
        assert_eq!(history[0].status, CommitStatus::Pending);
        assert_eq!(history[0].node.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_merge_keeps_external_entries() {
        let mut latest = vec![
            entry("box-aaaaa", CommitStatus::Pending, CommitStatus::Pending),
            entry("box-zzzzz", CommitStatus::Success, CommitStatus::Success),
        ];
        let working = vec![
            entry("box-aaaaa", CommitStatus::Success, CommitStatus::Success),
            entry("box-bbbbb", CommitStatus::Pending, CommitStatus::Pending),
        ];

        merge_commit_history(&mut latest, &working);

        let pods: Vec<&str> = latest.iter().map(|c| c.pod.as_str()).collect();
        assert_eq!(pods, vec!["box-aaaaa", "box-zzzzz", "box-bbbbb"]);
        assert_eq!(latest[0].status, CommitStatus::Success);
    }

    #[test]
    fn test_track_pod_rebuilds_missing_entry() {
        let mut pod = pod_with("box-ccccc", "Running", Some(running()));
        pod.metadata.annotations = Some(
            [(COMMIT_IMAGE_ANNOTATION.to_string(), "registry.local/ns/box:abcde".to_string())].into(),
        );
        let mut history = vec![entry("box-aaaaa", CommitStatus::Success, CommitStatus::Success)];

        assert!(track_pod(&mut history, &pod));
        assert!(!track_pod(&mut history, &pod));

        assert_eq!(history.len(), 2);
        assert_eq!(history[1].pod, "box-ccccc");
        assert_eq!(history[1].image, "registry.local/ns/box:abcde");
        assert_eq!(history[1].status, CommitStatus::Pending);
        assert_eq!(history[1].predicated_status, CommitStatus::Pending);
    }

    #[test]
    fn test_track_pod_reads_commit_image_env() {
        let mut pod = pod_with("box-ccccc", "Pending", None);
        pod.spec.as_mut().unwrap().containers = vec![k8s_openapi::api::core::v1::Container {
            name: "box".to_string(),
            env: Some(vec![k8s_openapi::api::core::v1::EnvVar {
                name: COMMIT_IMAGE_ENV.to_string(),
                value: Some("registry.local/ns/box:fghij".to_string()),
                value_from: None,
            }]),
            ..Default::default()
        }];
        let mut history = Vec::new();

        assert!(track_pod(&mut history, &pod));
        assert_eq!(history[0].image, "registry.local/ns/box:fghij");

        // Without either source there is nothing to record
        let mut history = Vec::new();
        assert!(!track_pod(&mut history, &pod_with("box-ddddd", "Pending", None)));
        assert!(history.is_empty());
    }

    #[test]
    fn test_last_successful_image() {
        let history = vec![
            entry("box-aaaaa", CommitStatus::Success, CommitStatus::Success),
            entry("box-bbbbb", CommitStatus::Failed, CommitStatus::Failed),
        ];
        assert_eq!(last_successful_image(&history), Some("registry.local/ns/box:box-aaaaa"));
        assert_eq!(last_successful_image(&[]), None);
    }

    #[test]
    fn test_derive_phase() {
        assert_eq!(derive_phase(DevboxState::Running, &[]), DevboxPhase::Pending);
        assert_eq!(derive_phase(DevboxState::Stopped, &[]), DevboxPhase::Stopped);

        let running_pod = pod_with("box-aaaaa", "Running", None);
        assert_eq!(derive_phase(DevboxState::Running, &[running_pod.clone()]), DevboxPhase::Running);
        assert_eq!(derive_phase(DevboxState::Stopped, &[running_pod.clone()]), DevboxPhase::Stopping);
        assert_eq!(
            derive_phase(DevboxState::Running, &[pod_with("p", "Failed", None)]),
            DevboxPhase::Error
        );
        assert_eq!(
            derive_phase(DevboxState::Running, &[running_pod.clone(), running_pod]),
            DevboxPhase::Error
        );
    }
}
