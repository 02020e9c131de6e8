//! Runtime CRD
//!
//! Read-only template referenced by devboxes. Owned by a separate controller;
//! the devbox controller only reads it.

use crate::schema::preserve_unknown_fields_list;
use k8s_openapi::api::core::v1::{ContainerPort, EnvVar, Volume, VolumeMount};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "devbox.microscaler.io",
    version = "v1alpha1",
    kind = "Runtime",
    namespaced,
    status = "RuntimeStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    /// Human readable version of the runtime, e.g. "go-1.22"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    pub config: RuntimeConfig,
}

/// Container template shared by every devbox using the runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub image: String,

    /// Ports the devbox exposes; an SSH port is assumed when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub ports: Vec<ContainerPort>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    /// Whether the runtime may be used for new devboxes
    #[serde(default)]
    pub available: bool,
}
