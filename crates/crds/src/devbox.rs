//! Devbox CRD
//!
//! A development container declared by a tenant. The controller derives a
//! credential secret, exactly one pod generation and the network objects that
//! expose it, and records container lifecycle plus commit provenance in status.

use crate::schema::{preserve_unknown_fields, preserve_unknown_fields_list, resource_list};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, ContainerPort, ContainerState, EnvVar, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "devbox.microscaler.io",
    version = "v1alpha1",
    kind = "Devbox",
    namespaced,
    status = "DevboxStatus",
    shortname = "dbx",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".spec.state"}"#,
    printcolumn = r#"{"name": "Network", "type": "string", "jsonPath": ".spec.network.type"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevboxSpec {
    /// Desired run state
    #[serde(default)]
    pub state: DevboxState,

    /// Runtime template the devbox instantiates
    pub runtime_ref: RuntimeRef,

    /// Resource limits for the devbox container (cpu, memory)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "resource_list")]
    pub resource: BTreeMap<String, Quantity>,

    /// How the devbox is exposed
    #[serde(default, rename = "network")]
    pub network_spec: NetworkSpec,

    /// Idle auto-shutdown handled by the websocket gateway
    #[serde(default)]
    pub auto_shutdown_spec: AutoShutdownSpec,

    /// Environment appended after the runtime's environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub extra_envs: Vec<EnvVar>,

    /// Volumes appended after the runtime's volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub extra_volumes: Vec<Volume>,

    /// Mounts appended after the runtime's mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub extra_volume_mounts: Vec<VolumeMount>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub affinity: Option<Affinity>,
}

/// Reference to a Runtime template
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRef {
    /// Name of the Runtime
    pub name: String,

    /// Namespace (defaults to the devbox's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Desired run state of a devbox
///
/// Serializes as PascalCase but also accepts lowercase values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum DevboxState {
    #[default]
    #[serde(alias = "running")]
    Running,
    #[serde(alias = "stopped")]
    Stopped,
}

/// Network exposure mode
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum NetworkType {
    /// Cluster-exposed NodePort service
    #[default]
    #[serde(alias = "nodeport")]
    NodePort,
    /// Websocket gateway behind an ingress
    #[serde(alias = "websocket")]
    WebSocket,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default, rename = "type")]
    pub network_type: NetworkType,

    /// Ports exposed in addition to the runtime's ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub extra_ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoShutdownSpec {
    #[serde(default)]
    pub enable: bool,

    /// Idle interval understood by the gateway, e.g. "30m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevboxStatus {
    #[serde(default)]
    pub phase: DevboxPhase,

    #[serde(default)]
    pub network: NetworkStatus,

    /// State of the devbox container in the live pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub state: Option<ContainerState>,

    /// State of the container when its last pod went away
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub last_termination_state: Option<ContainerState>,

    /// One entry per pod generation, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commit_history: Vec<CommitHistory>,
}

/// Observed phase of a devbox
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum DevboxPhase {
    #[default]
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "running")]
    Running,
    #[serde(alias = "stopping")]
    Stopping,
    #[serde(alias = "stopped")]
    Stopped,
    #[serde(alias = "error")]
    Error,
    #[serde(alias = "unknown")]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    #[serde(default, rename = "type")]
    pub network_type: NetworkType,

    /// Platform-assigned port (NodePort mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,

    /// Generated ingress host (WebSocket mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_socket_host: Option<String>,
}

/// One pod generation and the image it is committed to
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitHistory {
    /// Target image of the commit
    pub image: String,

    /// When the generation was created
    pub time: DateTime<Utc>,

    /// Pod that carried the generation
    pub pod: String,

    /// Confirmed commit status
    #[serde(default)]
    pub status: CommitStatus,

    /// Status predicted from the last observed container state
    #[serde(default)]
    pub predicated_status: CommitStatus,

    /// Node the generation was scheduled on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum CommitStatus {
    #[default]
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "success")]
    Success,
    #[serde(alias = "failed")]
    Failed,
}

impl Devbox {
    /// Status, or an empty one if the controller has not written it yet
    #[must_use]
    pub fn status_or_default(&self) -> DevboxStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Namespace of the referenced runtime, falling back to the devbox's own
    #[must_use]
    pub fn runtime_namespace(&self) -> Option<String> {
        self.spec
            .runtime_ref
            .namespace
            .clone()
            .or_else(|| self.metadata.namespace.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devbox_spec_defaults() {
        let spec: DevboxSpec = serde_json::from_value(serde_json::json!({
            "runtimeRef": {"name": "go-1-22"}
        }))
        .unwrap();

        assert_eq!(spec.state, DevboxState::Running);
        assert_eq!(spec.network_spec.network_type, NetworkType::NodePort);
        assert!(spec.resource.is_empty());
        assert!(!spec.auto_shutdown_spec.enable);
    }

    #[test]
    fn test_enum_lowercase_aliases() {
        let spec: DevboxSpec = serde_json::from_value(serde_json::json!({
            "state": "stopped",
            "runtimeRef": {"name": "go"},
            "network": {"type": "websocket"}
        }))
        .unwrap();

        assert_eq!(spec.state, DevboxState::Stopped);
        assert_eq!(spec.network_spec.network_type, NetworkType::WebSocket);

        // Always written back in PascalCase
        let out = serde_json::to_value(&spec).unwrap();
        assert_eq!(out["state"], "Stopped");
        assert_eq!(out["network"]["type"], "WebSocket");
    }

    #[test]
    fn test_commit_history_serialization() {
        let entry = CommitHistory {
            image: "registry.local/ns/box:abcde-2024-01-02-030405".to_string(),
            time: DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
            pod: "box-abcde".to_string(),
            status: CommitStatus::Pending,
            predicated_status: CommitStatus::Success,
            node: None,
        };

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["predicatedStatus"], "Success");
        assert_eq!(value["status"], "Pending");
        assert!(value.get("node").is_none());
    }
}
