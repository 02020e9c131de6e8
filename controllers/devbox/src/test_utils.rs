//! Test utilities for unit testing the reconciler
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use crate::config::ControllerConfig;
use crate::events::RecordingEventPublisher;
use crate::reconciler::Reconciler;
use cluster_client::MockClusterClient;
use crds::{
    AutoShutdownSpec, Devbox, DevboxSpec, DevboxState, NetworkSpec, NetworkType, Runtime, RuntimeConfig,
    RuntimeRef, RuntimeSpec,
};
use k8s_openapi::api::core::v1::{
    ContainerPort, ContainerState, ContainerStateRunning, ContainerStateWaiting, EnvVar,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAMESPACE: &str = "tenant-a";
pub const DEVBOX: &str = "box";
pub const RUNTIME: &str = "go-1-22";
pub const RUNTIME_IMAGE: &str = "ghcr.io/example/go:1.22";

/// Configuration with a gateway image and signing key set
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        websocket_image: Some("ghcr.io/example/ws-proxy:v1".to_string()),
        shutdown_server_addr: "http://shutdown.devbox-system:8080".to_string(),
        shutdown_server_key: "test-signing-key".to_string(),
        enable_auto_shutdown: true,
        ..ControllerConfig::default()
    }
}

/// Helper to create test Devbox CRD
pub fn create_test_devbox(name: &str, namespace: &str, state: DevboxState, network_type: NetworkType) -> Devbox {
    Devbox {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: DevboxSpec {
            state,
            runtime_ref: RuntimeRef {
                name: RUNTIME.to_string(),
                namespace: None,
            },
            resource: BTreeMap::from([
                ("cpu".to_string(), Quantity("2".to_string())),
                ("memory".to_string(), Quantity("4Gi".to_string())),
            ]),
            network_spec: NetworkSpec {
                network_type,
                extra_ports: Vec::new(),
            },
            auto_shutdown_spec: AutoShutdownSpec {
                enable: true,
                time: Some("30m".to_string()),
            },
            extra_envs: vec![EnvVar {
                name: "EDITOR".to_string(),
                value: Some("vim".to_string()),
                value_from: None,
            }],
            ..Default::default()
        },
        status: None,
    }
}

/// Helper to create test Runtime CRD exposing SSH on port 22
pub fn create_test_runtime(name: &str, namespace: &str, image: &str) -> Runtime {
    Runtime {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: RuntimeSpec {
            version: Some("1.22".to_string()),
            config: RuntimeConfig {
                image: image.to_string(),
                ports: vec![ContainerPort {
                    name: Some("ssh".to_string()),
                    container_port: 22,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }],
                working_dir: Some("/home/devbox/project".to_string()),
                command: vec!["/bin/bash".to_string(), "-c".to_string()],
                args: vec!["/usr/start/entrypoint.sh".to_string()],
                ..Default::default()
            },
        },
        status: None,
    }
}

/// Mock store, recorded events and a reconciler wired to both
pub struct TestHarness {
    pub mock: MockClusterClient,
    pub events: RecordingEventPublisher,
    pub reconciler: Reconciler,
}

impl TestHarness {
    pub fn new(config: ControllerConfig) -> Self {
        let mock = MockClusterClient::new();
        let events = RecordingEventPublisher::default();
        let reconciler = Reconciler::new(mock.clone(), events.clone(), Arc::new(config));
        Self {
            mock,
            events,
            reconciler,
        }
    }

    /// Harness with the test runtime and one devbox already stored
    pub fn with_devbox(state: DevboxState, network_type: NetworkType) -> Self {
        let harness = Self::new(test_config());
        harness
            .mock
            .add_runtime(create_test_runtime(RUNTIME, NAMESPACE, RUNTIME_IMAGE));
        harness
            .mock
            .add_devbox(create_test_devbox(DEVBOX, NAMESPACE, state, network_type));
        harness
    }

    pub async fn reconcile(&self) -> Result<kube_runtime::controller::Action, crate::error::ControllerError> {
        self.reconciler.reconcile(NAMESPACE, DEVBOX).await
    }

    pub fn devbox(&self) -> Devbox {
        self.mock.devbox(NAMESPACE, DEVBOX).expect("devbox should exist")
    }

    pub fn only_pod_name(&self) -> String {
        let pods = self.mock.pods(NAMESPACE);
        assert_eq!(pods.len(), 1, "expected exactly one pod");
        pods[0].metadata.name.clone().expect("pod name")
    }
}

pub fn running_state() -> ContainerState {
    ContainerState {
        running: Some(ContainerStateRunning::default()),
        ..Default::default()
    }
}

pub fn waiting_state(reason: &str) -> ContainerState {
    ContainerState {
        waiting: Some(ContainerStateWaiting {
            reason: Some(reason.to_string()),
            message: None,
        }),
        ..Default::default()
    }
}
