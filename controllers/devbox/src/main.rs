//! Devbox Controller
//!
//! Reconciles `Devbox` CRDs into the objects that make up a development
//! container:
//! - a credential secret with an SSH keypair and a shared token
//! - exactly one pod generation, tracked in the commit history
//! - network exposure through a NodePort service or a websocket gateway
//!   (deployment, services and ingress)
//!
//! Devbox status is the contract observed by UIs and CLIs.

mod backoff;
mod config;
mod controller;
mod credentials;
mod error;
mod events;
mod labels;
mod metrics;
mod quantity;
mod reconciler;
mod retry;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Devbox Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Commit registry: {}", config.commit_image_registry);
    info!("  Proxy domain: {}", config.websocket_proxy_domain);
    info!("  Websocket image: {}", config.websocket_image.as_deref().unwrap_or("<unset>"));
    info!("  Auto shutdown: {}", config.enable_auto_shutdown);
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Concurrency: {}", config.concurrency);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
