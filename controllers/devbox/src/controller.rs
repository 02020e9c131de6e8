//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the Kubernetes
//! client, reconciler and watcher together and runs them next to the probe
//! and metrics server.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::KubeEventPublisher;
use crate::labels::MANAGER;
use crate::metrics::{self, Metrics};
use crate::reconciler::Reconciler;
use crate::watcher::{Context, Watcher};
use cluster_client::KubeClusterClient;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for Devbox management.
pub struct Controller {
    devbox_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Devbox Controller");

        let kube_client = Client::try_default().await?;
        let config = Arc::new(config);

        let reconciler = Reconciler::new(
            KubeClusterClient::new(kube_client.clone()),
            KubeEventPublisher::new(kube_client.clone(), MANAGER),
            config.clone(),
        );
        let metrics = Metrics::new()?;
        let context = Arc::new(Context {
            reconciler,
            metrics: metrics.clone(),
        });

        let watcher = Watcher::new(
            kube_client,
            context,
            config.watch_namespace.clone(),
            config.concurrency,
        );

        let metrics_addr = config.metrics_addr;
        let metrics_server = tokio::spawn(metrics::serve(metrics_addr, metrics.clone()));
        let devbox_watcher = tokio::spawn(watcher.watch_devboxes());
        metrics.mark_ready();

        Ok(Self {
            devbox_watcher,
            metrics_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Devbox Controller running");

        // The watcher returns on SIGTERM/SIGINT; the metrics server only on failure
        tokio::select! {
            result = &mut self.devbox_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Devbox watcher panicked: {}", e)))??;
            }
            result = &mut self.metrics_server => {
                result.map_err(|e| ControllerError::Metrics(format!("Metrics server panicked: {}", e)))??;
            }
        }

        self.metrics_server.abort();
        info!("Devbox Controller stopped");
        Ok(())
    }
}
