//! Kubernetes resource watchers.
//!
//! Devboxes are watched through `kube_runtime::Controller`, which handles
//! reconnection, per-object serialization and requeues. Changes to the pods,
//! services, secrets, gateway deployments and ingresses a devbox owns map back
//! to the owning devbox. Owned watches only see objects labelled as managed by
//! this controller.

use crate::error::ControllerError;
use crate::labels::managed_by_selector;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crds::Devbox;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::{Action, Config as RuntimeConfig};
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Shared state handed to every reconciliation
pub struct Context {
    pub reconciler: Reconciler,
    pub metrics: Metrics,
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn object_key(devbox: &Devbox) -> String {
    format!("{}/{}", devbox.namespace().unwrap_or_default(), devbox.name_any())
}

async fn reconcile(devbox: Arc<Devbox>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let namespace = devbox.namespace().unwrap_or_default();
    let name = devbox.name_any();
    debug!(namespace = %namespace, name = %name, "Reconciling devbox");

    let started = Instant::now();
    match ctx.reconciler.reconcile(&namespace, &name).await {
        Ok(action) => {
            ctx.metrics.observe_success(started.elapsed());
            ctx.reconciler.reset_backoff(&object_key(&devbox));
            Ok(action)
        }
        Err(e) => {
            ctx.metrics.observe_failure(&e, started.elapsed());
            Err(e)
        }
    }
}

/// Requeue failed devboxes with a per-object Fibonacci backoff
fn error_policy(devbox: Arc<Devbox>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let key = object_key(&devbox);
    let delay = ctx.reconciler.next_backoff(&key);
    warn!(devbox = %key, error = %error, retry_in_secs = delay.as_secs(), "Reconciliation failed");
    Action::requeue(delay)
}

/// Watches devboxes and the objects derived from them.
pub struct Watcher {
    client: Client,
    context: Arc<Context>,
    namespace: Option<String>,
    concurrency: u16,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(client: Client, context: Arc<Context>, namespace: Option<String>, concurrency: u16) -> Self {
        Self {
            client,
            context,
            namespace,
            concurrency,
        }
    }

    /// Run the devbox controller loop until shutdown is signalled
    pub async fn watch_devboxes(self) -> Result<(), ControllerError> {
        let ns = self.namespace.as_deref();
        info!(namespace = ns.unwrap_or("all namespaces"), "Starting Devbox watcher");

        let owned = watcher::Config::default().labels(&managed_by_selector());

        // Debounce batches the status writes of one pass into a single trigger
        let config = RuntimeConfig::default()
            .debounce(Duration::from_secs(1))
            .concurrency(self.concurrency);

        Controller::new(api::<Devbox>(&self.client, ns), watcher::Config::default())
            .owns(api::<Pod>(&self.client, ns), owned.clone())
            .owns(api::<Service>(&self.client, ns), owned.clone())
            .owns(api::<Secret>(&self.client, ns), owned.clone())
            .owns(api::<Deployment>(&self.client, ns), owned.clone())
            .owns(api::<Ingress>(&self.client, ns), owned)
            .with_config(config)
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.context)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!(devbox = %obj, "Reconciled"),
                    Err(e) => error!("Devbox controller error: {}", e),
                }
            })
            .await;

        info!("Devbox watcher stopped");
        Ok(())
    }
}
