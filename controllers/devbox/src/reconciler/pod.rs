//! Pod lifecycle of a devbox.
//!
//! At most one pod exists per devbox. A pod that no longer matches the
//! expected spec, or has finished, is deleted and recreated on a later pass
//! as a new generation with a new commit entry.

use super::commit::{
    confirm_commit, derive_phase, first_container_state, last_successful_image, new_commit_entry, record_node,
    track_pod, update_predicated_status,
};
use super::secret::JWT_SECRET_KEY;
use super::{Reconciler, child_meta, devbox_key};
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::labels::{
    COMMIT_IMAGE_ANNOTATION, FINALIZER, RUNTIME_ANNOTATION, pod_labels, recommended_labels, secret_name,
};
use crate::quantity;
use crds::{CommitHistory, Devbox, DevboxPhase, DevboxState, DevboxStatus, Runtime};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, KeyToPath, Pod, PodSpec, ResourceRequirements,
    SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const SSH_VOLUME: &str = "devbox-ssh-keys";
pub const SSH_MOUNT_PATH: &str = "/usr/start/.ssh";
pub const COMMIT_IMAGE_ENV: &str = "DEVBOX_COMMIT_IMAGE";
const TERMINATION_GRACE_SECONDS: i64 = 300;

/// What a pass did to the pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PodAction {
    None,
    Created,
    Deleted,
    /// Creation hit the namespace quota and the devbox was forced to Stopped
    QuotaStopped,
}

fn generated_env(devbox_name: &str, namespace: &str, entry: &CommitHistory) -> Vec<EnvVar> {
    let plain = |name: &str, value: &str| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    };
    vec![
        plain("DEVBOX_NAME", devbox_name),
        plain("DEVBOX_NAMESPACE", namespace),
        plain(COMMIT_IMAGE_ENV, &entry.image),
        EnvVar {
            name: JWT_SECRET_KEY.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret_name(devbox_name),
                    key: JWT_SECRET_KEY.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
        },
    ]
}

fn ssh_volume(devbox_name: &str) -> Volume {
    let item = |key: &str, path: &str| KeyToPath {
        key: key.to_string(),
        path: path.to_string(),
        mode: None,
    };
    Volume {
        name: SSH_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name(devbox_name)),
            items: Some(vec![
                item(super::secret::AUTHORIZED_KEYS_KEY, "authorized_keys"),
                item(super::secret::PUBLIC_KEY_KEY, "id.pub"),
                item(super::secret::PRIVATE_KEY_KEY, "id"),
            ]),
            default_mode: Some(0o600),
            optional: None,
        }),
        ..Default::default()
    }
}

fn ssh_volume_mount() -> VolumeMount {
    VolumeMount {
        name: SSH_VOLUME.to_string(),
        mount_path: SSH_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Limits from the devbox plus the ephemeral-storage limit; requests are the
/// limits divided by the overcommit rates
fn resource_requirements(
    resource: &BTreeMap<String, Quantity>,
    cpu_rate: f64,
    memory_rate: f64,
    request_ephemeral: &str,
    limit_ephemeral: &str,
) -> Result<ResourceRequirements, ControllerError> {
    let mut limits = resource.clone();
    limits.insert("ephemeral-storage".to_string(), Quantity(limit_ephemeral.to_string()));

    let mut requests = BTreeMap::new();
    if let Some(cpu) = resource.get("cpu") {
        let request = quantity::divide_cpu(cpu, cpu_rate)
            .ok_or_else(|| ControllerError::InvalidResource(format!("cpu quantity {:?}", cpu.0)))?;
        requests.insert("cpu".to_string(), request);
    }
    if let Some(memory) = resource.get("memory") {
        let request = quantity::divide_memory(memory, memory_rate)
            .ok_or_else(|| ControllerError::InvalidResource(format!("memory quantity {:?}", memory.0)))?;
        requests.insert("memory".to_string(), request);
    }
    requests.insert("ephemeral-storage".to_string(), Quantity(request_ephemeral.to_string()));

    Ok(ResourceRequirements {
        limits: Some(limits),
        requests: Some(requests),
        ..Default::default()
    })
}

fn quantities_equal(a: Option<&BTreeMap<String, Quantity>>, b: Option<&BTreeMap<String, Quantity>>) -> bool {
    let empty = BTreeMap::new();
    let (a, b) = (a.unwrap_or(&empty), b.unwrap_or(&empty));
    a.len() == b.len()
        && a
            .iter()
            .all(|(k, v)| b.get(k).is_some_and(|other| quantity::equal(v, other)))
}

fn normalized_ports(ports: Option<&Vec<ContainerPort>>) -> Vec<(i32, String, Option<String>)> {
    ports
        .into_iter()
        .flatten()
        .map(|p| {
            (
                p.container_port,
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                p.name.clone(),
            )
        })
        .collect()
}

/// Env without the commit image. The API server drops empty values, so an
/// empty value compares equal to none.
fn normalized_env(env: Option<&Vec<EnvVar>>) -> Vec<(&str, Option<&str>, Option<&EnvVarSource>)> {
    env.into_iter()
        .flatten()
        .filter(|e| e.name != COMMIT_IMAGE_ENV)
        .map(|e| {
            (
                e.name.as_str(),
                e.value.as_deref().filter(|v| !v.is_empty()),
                e.value_from.as_ref(),
            )
        })
        .collect()
}

fn mounts(container: &Container) -> Vec<(&str, &str, Option<&str>)> {
    container
        .volume_mounts
        .iter()
        .flatten()
        .map(|m| (m.name.as_str(), m.mount_path.as_str(), m.sub_path.as_deref()))
        .collect()
}

fn volume_names(pod: &Pod) -> Vec<&str> {
    pod.spec
        .iter()
        .flat_map(|s| s.volumes.iter().flatten())
        .map(|v| v.name.as_str())
        .collect()
}

/// Compare the fields the controller sets. Fields the platform mutates and the
/// per-generation commit image are ignored.
pub(crate) fn pod_matches(expected: &Pod, actual: &Pod) -> bool {
    let first = |pod: &Pod| pod.spec.as_ref().and_then(|s| s.containers.first().cloned());
    let (Some(want), Some(have)) = (first(expected), first(actual)) else {
        return false;
    };

    if want.image != have.image {
        debug!(expected = ?want.image, actual = ?have.image, "Pod image differs");
        return false;
    }
    if normalized_env(want.env.as_ref()) != normalized_env(have.env.as_ref()) {
        debug!("Pod env differs");
        return false;
    }
    if normalized_ports(want.ports.as_ref()) != normalized_ports(have.ports.as_ref()) {
        debug!("Pod ports differ");
        return false;
    }
    if volume_names(expected) != volume_names(actual) || mounts(&want) != mounts(&have) {
        debug!("Pod volumes differ");
        return false;
    }
    let want_resources = want.resources.unwrap_or_default();
    let have_resources = have.resources.unwrap_or_default();
    if !quantities_equal(want_resources.limits.as_ref(), have_resources.limits.as_ref())
        || !quantities_equal(want_resources.requests.as_ref(), have_resources.requests.as_ref())
    {
        debug!("Pod resources differ");
        return false;
    }
    want.command == have.command && want.args == have.args && want.working_dir == have.working_dir
}

fn track_live_pod(namespace: &str, pod: &Pod, status: &mut DevboxStatus) {
    if track_pod(&mut status.commit_history, pod) {
        warn!(namespace, pod = %pod.name_any(), "Pod had no commit entry, recorded it from the pod");
    }
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

impl Reconciler {
    /// Desired pod for the next generation
    pub(crate) fn expected_pod(
        &self,
        devbox: &Devbox,
        runtime: &Runtime,
        entry: &CommitHistory,
        history: &[CommitHistory],
    ) -> Result<Pod, ControllerError> {
        let (namespace, name) = devbox_key(devbox);
        let runtime_name = runtime.name_any();
        let config = &runtime.spec.config;

        let image = if self.config.debug_mode {
            config.image.clone()
        } else {
            last_successful_image(history).map_or_else(|| config.image.clone(), str::to_string)
        };

        let mut env = config.env.clone();
        env.extend(devbox.spec.extra_envs.iter().cloned());
        env.extend(generated_env(&name, &namespace, entry));

        let mut ports = config.ports.clone();
        ports.extend(devbox.spec.network_spec.extra_ports.iter().cloned());

        let mut volumes = config.volumes.clone();
        volumes.push(ssh_volume(&name));
        volumes.extend(devbox.spec.extra_volumes.iter().cloned());

        let mut volume_mounts = config.volume_mounts.clone();
        volume_mounts.push(ssh_volume_mount());
        volume_mounts.extend(devbox.spec.extra_volume_mounts.iter().cloned());

        let resources = resource_requirements(
            &devbox.spec.resource,
            self.config.request_cpu_rate,
            self.config.request_memory_rate,
            &self.config.request_ephemeral_storage,
            &self.config.limit_ephemeral_storage,
        )?;

        let mut metadata = child_meta(devbox, entry.pod.clone(), pod_labels(&name, &runtime_name));
        metadata.annotations = Some(BTreeMap::from([
            (COMMIT_IMAGE_ANNOTATION.to_string(), entry.image.clone()),
            (RUNTIME_ANNOTATION.to_string(), runtime_name),
        ]));
        metadata.finalizers = Some(vec![FINALIZER.to_string()]);

        let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());

        Ok(Pod {
            metadata,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: name.clone(),
                    image: Some(image),
                    env: Some(env),
                    ports: Some(ports),
                    volume_mounts: Some(volume_mounts),
                    working_dir: config.working_dir.clone(),
                    command: non_empty(&config.command),
                    args: non_empty(&config.args),
                    resources: Some(resources),
                    ..Default::default()
                }],
                volumes: Some(volumes),
                termination_grace_period_seconds: Some(TERMINATION_GRACE_SECONDS),
                automount_service_account_token: Some(false),
                restart_policy: Some("Never".to_string()),
                hostname: Some(name),
                tolerations: (!devbox.spec.tolerations.is_empty()).then(|| devbox.spec.tolerations.clone()),
                affinity: devbox.spec.affinity.clone(),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Drive the devbox's pod towards its desired state and record the
    /// outcome in status
    pub(crate) async fn sync_pod(&self, devbox: &Devbox) -> Result<(), ControllerError> {
        let (namespace, name) = devbox_key(devbox);
        let pods = self.client.list_pods(&namespace, &recommended_labels(&name)).await?;
        let mut status = devbox.status_or_default();

        let outcome = match pods.as_slice() {
            [] | [_] => match devbox.spec.state {
                DevboxState::Running => self.sync_running_pod(devbox, pods.first(), &mut status).await,
                DevboxState::Stopped => self.sync_stopped_pod(devbox, pods.first(), &mut status).await,
            },
            _ => {
                warn!(namespace = %namespace, name = %name, count = pods.len(), "More than one pod found");
                Err(ControllerError::MultiplePods(format!("{namespace}/{name}")))
            }
        };

        let phase = match outcome {
            Ok(PodAction::Deleted) => DevboxPhase::Stopping,
            Ok(PodAction::QuotaStopped) => derive_phase(DevboxState::Stopped, &[]),
            _ => derive_phase(devbox.spec.state, &pods),
        };

        let written = self
            .update_status(&namespace, &name, |latest| {
                latest.phase = phase;
                super::commit::merge_commit_history(&mut latest.commit_history, &status.commit_history);
                latest.state.clone_from(&status.state);
                latest.last_termination_state.clone_from(&status.last_termination_state);
            })
            .await;

        outcome?;
        written
    }

    async fn sync_running_pod(
        &self,
        devbox: &Devbox,
        pod: Option<&Pod>,
        status: &mut DevboxStatus,
    ) -> Result<PodAction, ControllerError> {
        let (namespace, name) = devbox_key(devbox);
        let runtime = self.get_runtime(devbox).await?;
        let entry = new_commit_entry(
            &self.config.commit_image_registry,
            &namespace,
            &name,
            chrono::Utc::now(),
        );
        let expected = self.expected_pod(devbox, &runtime, &entry, &status.commit_history)?;

        let Some(pod) = pod else {
            return match self.client.create_pod(&expected).await {
                Ok(_) => {
                    info!(namespace = %namespace, name = %name, pod = %entry.pod, "Created pod");
                    status.commit_history.push(entry);
                    Ok(PodAction::Created)
                }
                Err(e) if e.is_quota_exceeded() => {
                    warn!(namespace = %namespace, name = %name, error = %e, "Quota exceeded, stopping devbox");
                    self.force_stopped(&namespace, &name).await?;
                    self.events
                        .publish(
                            &kube::Resource::object_ref(devbox, &()),
                            EventType::Warning,
                            reasons::QUOTA_EXCEEDED,
                            actions::CREATE_POD,
                            Some(e.to_string()),
                        )
                        .await;
                    Ok(PodAction::QuotaStopped)
                }
                Err(e) => Err(e.into()),
            };
        };

        track_live_pod(&namespace, pod, status);
        status.state = first_container_state(pod);
        update_predicated_status(&mut status.commit_history, pod);

        if pod.metadata.deletion_timestamp.is_some() {
            self.handle_pod_deleted(&namespace, pod, status).await?;
            return Ok(PodAction::None);
        }

        if !pod_matches(&expected, pod) {
            info!(namespace = %namespace, name = %name, pod = %pod.name_any(), "Pod is stale, recreating");
            self.delete_pod(&namespace, pod, status).await?;
            return Ok(PodAction::Deleted);
        }

        match pod_phase(pod) {
            Some("Failed" | "Succeeded") => {
                info!(namespace = %namespace, name = %name, pod = %pod.name_any(), "Pod finished, recreating");
                self.delete_pod(&namespace, pod, status).await?;
                Ok(PodAction::Deleted)
            }
            _ => {
                record_node(&mut status.commit_history, pod);
                Ok(PodAction::None)
            }
        }
    }

    async fn sync_stopped_pod(
        &self,
        devbox: &Devbox,
        pod: Option<&Pod>,
        status: &mut DevboxStatus,
    ) -> Result<PodAction, ControllerError> {
        let (namespace, name) = devbox_key(devbox);
        status.state = None;
        let Some(pod) = pod else {
            return Ok(PodAction::None);
        };

        track_live_pod(&namespace, pod, status);
        update_predicated_status(&mut status.commit_history, pod);
        if pod.metadata.deletion_timestamp.is_some() {
            self.handle_pod_deleted(&namespace, pod, status).await?;
            return Ok(PodAction::None);
        }

        info!(namespace = %namespace, name = %name, pod = %pod.name_any(), "Devbox stopped, deleting pod");
        self.delete_pod(&namespace, pod, status).await?;
        Ok(PodAction::Deleted)
    }

    async fn delete_pod(&self, namespace: &str, pod: &Pod, status: &mut DevboxStatus) -> Result<(), ControllerError> {
        let pod_name = pod.name_any();
        self.remove_pod_finalizer(namespace, &pod_name).await?;
        self.client.delete_pod(namespace, &pod_name).await?;
        status.last_termination_state = first_container_state(pod);
        confirm_commit(&mut status.commit_history, &pod_name);
        Ok(())
    }

    /// Finish a pod deletion someone else started
    async fn handle_pod_deleted(&self, namespace: &str, pod: &Pod, status: &mut DevboxStatus) -> Result<(), ControllerError> {
        let pod_name = pod.name_any();
        debug!(namespace, pod = %pod_name, "Pod is being deleted, releasing it");
        self.remove_pod_finalizer(namespace, &pod_name).await?;
        status.last_termination_state = first_container_state(pod);
        confirm_commit(&mut status.commit_history, &pod_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn test_resource_requirements_divide_by_rate() {
        let resource = BTreeMap::from([("cpu".to_string(), q("2")), ("memory".to_string(), q("4Gi"))]);
        let req = resource_requirements(&resource, 10.0, 4.0, "500Mi", "10Gi").unwrap();

        let limits = req.limits.unwrap();
        let requests = req.requests.unwrap();
        assert_eq!(limits["ephemeral-storage"], q("10Gi"));
        assert_eq!(requests["cpu"], q("200m"));
        assert_eq!(requests["memory"], q("1073741824"));
        assert_eq!(requests["ephemeral-storage"], q("500Mi"));
    }

    #[test]
    fn test_invalid_quantity_is_rejected() {
        let resource = BTreeMap::from([("cpu".to_string(), q("two"))]);
        let err = resource_requirements(&resource, 10.0, 10.0, "500Mi", "10Gi").unwrap_err();
        assert!(matches!(err, ControllerError::InvalidResource(_)));
    }

    fn pod_with_env(env: Vec<EnvVar>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "box".to_string(),
                    image: Some("ghcr.io/example/go:1.22".to_string()),
                    env: Some(env),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn env(name: &str, value: Option<&str>) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: value.map(str::to_string),
            value_from: None,
        }
    }

    #[test]
    fn test_pod_matches_treats_empty_env_value_as_unset() {
        let expected = pod_with_env(vec![env("EDITOR", Some("")), env(COMMIT_IMAGE_ENV, Some("a"))]);
        let served = pod_with_env(vec![env("EDITOR", None), env(COMMIT_IMAGE_ENV, Some("b"))]);
        assert!(pod_matches(&expected, &served));

        let changed = pod_with_env(vec![env("EDITOR", Some("vim")), env(COMMIT_IMAGE_ENV, Some("a"))]);
        assert!(!pod_matches(&expected, &changed));
    }

    #[test]
    fn test_quantities_equal_ignores_notation() {
        let a = BTreeMap::from([("cpu".to_string(), q("0.2"))]);
        let b = BTreeMap::from([("cpu".to_string(), q("200m"))]);
        assert!(quantities_equal(Some(&a), Some(&b)));
        assert!(!quantities_equal(Some(&a), None));
    }
}
