//! Network exposure of a devbox.
//!
//! NodePort mode publishes one NodePort service selecting the devbox pod.
//! WebSocket mode fronts the pod with a ClusterIP service, a single-replica
//! gateway deployment, a service for the gateway and an ingress with a
//! generated host. Objects of the inactive mode are removed.

use super::{Reconciler, child_meta, devbox_key, owner_references};
use crate::credentials::{random_suffix, sign_gateway_token};
use crate::error::ControllerError;
use crate::labels::{
    node_port_service_name, pod_service_name, proxy_deployment_name, proxy_ingress_name, proxy_labels,
    proxy_service_name, recommended_labels,
};
use cluster_client::Labels;
use crds::{Devbox, DevboxState, NetworkStatus, NetworkType, Runtime};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend,
    IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const SSH_PORT_NAME: &str = "devbox-ssh-port";
const SSH_PORT: i32 = 22;
const PROXY_PORT: i32 = 80;
const PROXY_CONTAINER: &str = "ws-proxy";
const HOST_PREFIX_LENGTH: usize = 12;

const INGRESS_TIMEOUT_ANNOTATIONS: &[(&str, &str)] = &[
    ("nginx.ingress.kubernetes.io/proxy-read-timeout", "3600"),
    ("nginx.ingress.kubernetes.io/proxy-send-timeout", "3600"),
];

/// Service ports for the runtime's ports plus the devbox's extra ports
pub fn service_ports(runtime: &Runtime, extra_ports: &[ContainerPort]) -> Vec<ServicePort> {
    let mut ports: Vec<ServicePort> = Vec::new();
    for port in runtime.spec.config.ports.iter().chain(extra_ports) {
        if ports.iter().any(|p| p.port == port.container_port) {
            continue;
        }
        ports.push(ServicePort {
            name: Some(
                port.name
                    .clone()
                    .unwrap_or_else(|| format!("port-{}", port.container_port)),
            ),
            port: port.container_port,
            target_port: Some(IntOrString::Int(port.container_port)),
            protocol: Some(port.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
            ..Default::default()
        });
    }
    if ports.is_empty() {
        ports.push(ServicePort {
            name: Some(SSH_PORT_NAME.to_string()),
            port: SSH_PORT,
            target_port: Some(IntOrString::Int(SSH_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
    ports
}

/// Port the gateway forwards to: the SSH port if named, else the first one
fn ssh_target_port(ports: &[ServicePort]) -> i32 {
    ports
        .iter()
        .find(|p| p.name.as_deref() == Some(SSH_PORT_NAME))
        .or_else(|| ports.first())
        .map_or(SSH_PORT, |p| match &p.target_port {
            Some(IntOrString::Int(port)) => *port,
            _ => p.port,
        })
}

/// Desired ports merged with the live ones. Allocated node ports are kept for
/// ports matched by name or number when the service stays a NodePort.
fn merge_ports(existing: &[ServicePort], wanted: &[ServicePort], keep_node_ports: bool) -> Vec<ServicePort> {
    wanted
        .iter()
        .map(|port| {
            let mut merged = port.clone();
            if keep_node_ports {
                let live = existing
                    .iter()
                    .find(|p| p.name.is_some() && p.name == port.name)
                    .or_else(|| existing.iter().find(|p| p.port == port.port));
                merged.node_port = live.and_then(|p| p.node_port);
            }
            merged
        })
        .collect()
}

fn labels_cover(have: Option<&BTreeMap<String, String>>, wanted: Option<&BTreeMap<String, String>>) -> bool {
    wanted
        .into_iter()
        .flatten()
        .all(|(k, v)| have.and_then(|h| h.get(k)) == Some(v))
}

fn service(devbox: &Devbox, name: String, labels: Labels, selector: Labels, type_: &str, ports: Vec<ServicePort>) -> Service {
    Service {
        metadata: child_meta(devbox, name, labels),
        spec: Some(ServiceSpec {
            selector: Some(selector),
            type_: Some(type_.to_string()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn proxy_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("10m".to_string())),
            ("memory".to_string(), Quantity("32Mi".to_string())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("200m".to_string())),
            ("memory".to_string(), Quantity("128Mi".to_string())),
        ])),
        ..Default::default()
    }
}

fn env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    }
}

fn gateway_container(template: &PodTemplateSpec) -> Option<&Container> {
    template.spec.as_ref()?.containers.first()
}

/// Whether two gateway templates differ in anything but the signed token
fn gateway_drifted(live: &Deployment, wanted: &Deployment) -> bool {
    let live_container = live.spec.as_ref().and_then(|s| gateway_container(&s.template));
    let wanted_container = wanted.spec.as_ref().and_then(|s| gateway_container(&s.template));
    let (Some(live), Some(wanted)) = (live_container, wanted_container) else {
        return true;
    };
    let without_token = |c: &Container| -> Vec<EnvVar> {
        c.env
            .iter()
            .flatten()
            .filter(|e| e.name != "JWT_TOKEN")
            .cloned()
            .collect()
    };
    live.image != wanted.image || without_token(live) != without_token(wanted) || live.resources != wanted.resources
}

/// Host of an ingress's first rule
fn ingress_host(ingress: &Ingress) -> Option<String> {
    ingress.spec.as_ref()?.rules.as_ref()?.first()?.host.clone()
}

impl Reconciler {
    /// Provision the network objects of the devbox's mode and publish the
    /// resulting endpoint in status
    pub(crate) async fn sync_network(&self, devbox: &Devbox) -> Result<(), ControllerError> {
        let (namespace, name) = devbox_key(devbox);
        // Teardown of a stopped devbox must not depend on its runtime
        let runtime = match self.get_runtime(devbox).await {
            Ok(runtime) => Some(runtime),
            Err(ControllerError::RuntimeNotFound(runtime)) if devbox.spec.state == DevboxState::Stopped => {
                debug!(
                    namespace = %namespace,
                    name = %name,
                    runtime = %runtime,
                    "Runtime not found, leaving services as they are"
                );
                None
            }
            Err(e) => return Err(e),
        };
        let ports = runtime
            .as_ref()
            .map(|runtime| service_ports(runtime, &devbox.spec.network_spec.extra_ports));

        let network = match devbox.spec.network_spec.network_type {
            NetworkType::NodePort => self.sync_node_port_network(devbox, ports.as_deref()).await?,
            NetworkType::WebSocket => self.sync_websocket_network(devbox, ports.as_deref()).await?,
        };

        self.update_status(&namespace, &name, |status| {
            status.network = network.clone();
        })
        .await
    }

    /// `ports` is `None` only for a stopped devbox whose runtime is gone; the
    /// live service is then kept as is.
    async fn sync_node_port_network(
        &self,
        devbox: &Devbox,
        ports: Option<&[ServicePort]>,
    ) -> Result<NetworkStatus, ControllerError> {
        let (namespace, name) = devbox_key(devbox);
        self.teardown_websocket(&namespace, &name).await?;

        let service_name = node_port_service_name(&name);
        if let Some(ports) = ports {
            let desired = service(
                devbox,
                service_name.clone(),
                recommended_labels(&name),
                recommended_labels(&name),
                "NodePort",
                ports.to_vec(),
            );
            self.upsert_service(&desired).await?;
        }

        // The port is assigned by the platform; read it back
        let live = self.client.get_service(&namespace, &service_name).await?;
        let node_port = live
            .as_ref()
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.ports.as_ref())
            .and_then(|p| p.first())
            .and_then(|p| p.node_port)
            .filter(|p| *p > 0);
        if node_port.is_none() && ports.is_some() {
            return Err(ControllerError::NodePortNotAllocated(format!("{namespace}/{service_name}")));
        }

        Ok(NetworkStatus {
            network_type: NetworkType::NodePort,
            node_port,
            web_socket_host: None,
        })
    }

    async fn sync_websocket_network(
        &self,
        devbox: &Devbox,
        ports: Option<&[ServicePort]>,
    ) -> Result<NetworkStatus, ControllerError> {
        let (namespace, name) = devbox_key(devbox);

        if let Some(ports) = ports {
            let pod_service = service(
                devbox,
                pod_service_name(&name),
                recommended_labels(&name),
                recommended_labels(&name),
                "ClusterIP",
                ports.to_vec(),
            );
            self.upsert_service(&pod_service).await?;
        }

        let running_ports = ports.filter(|_| devbox.spec.state == DevboxState::Running);
        let host = if let Some(ports) = running_ports {
            self.sync_proxy_deployment(devbox, ports).await?;
            let proxy_service = service(
                devbox,
                proxy_service_name(&name),
                proxy_labels(&name),
                proxy_labels(&name),
                "ClusterIP",
                vec![ServicePort {
                    name: Some("http".to_string()),
                    port: PROXY_PORT,
                    target_port: Some(IntOrString::Int(PROXY_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }],
            );
            self.upsert_service(&proxy_service).await?;
            Some(self.sync_proxy_ingress(devbox).await?)
        } else {
            // No idle gateway capacity for stopped devboxes
            if self.client.delete_deployment(&namespace, &proxy_deployment_name(&name)).await? {
                info!(namespace = %namespace, name = %name, "Deleted gateway deployment");
            }
            if self.client.delete_ingress(&namespace, &proxy_ingress_name(&name)).await? {
                info!(namespace = %namespace, name = %name, "Deleted gateway ingress");
            }
            self.published_host(devbox)
        };

        if self.client.delete_service(&namespace, &node_port_service_name(&name)).await? {
            info!(namespace = %namespace, name = %name, "Deleted NodePort service after mode switch");
        }

        Ok(NetworkStatus {
            network_type: NetworkType::WebSocket,
            node_port: None,
            web_socket_host: host,
        })
    }

    async fn teardown_websocket(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let mut removed = self.client.delete_ingress(namespace, &proxy_ingress_name(name)).await?;
        removed |= self.client.delete_deployment(namespace, &proxy_deployment_name(name)).await?;
        removed |= self.client.delete_service(namespace, &proxy_service_name(name)).await?;
        removed |= self.client.delete_service(namespace, &pod_service_name(name)).await?;
        if removed {
            info!(namespace, name, "Removed websocket gateway after mode switch");
        }
        Ok(())
    }

    /// Create the service, or rewrite the controller-owned fields of the live one
    async fn upsert_service(&self, desired: &Service) -> Result<(), ControllerError> {
        let namespace = desired.metadata.namespace.clone().unwrap_or_default();
        let name = desired.metadata.name.clone().unwrap_or_default();
        let wanted = desired.spec.clone().unwrap_or_default();

        let Some(mut live) = self.client.get_service(&namespace, &name).await? else {
            match self.client.create_service(desired).await {
                Ok(_) => info!(namespace = %namespace, service = %name, "Created service"),
                Err(e) if e.is_already_exists() => {
                    debug!(namespace = %namespace, service = %name, "Service created concurrently");
                }
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        };

        let keep_node_ports = wanted.type_.as_deref() == Some("NodePort");
        let spec = live.spec.get_or_insert_with(ServiceSpec::default);
        let ports = merge_ports(
            spec.ports.as_deref().unwrap_or_default(),
            wanted.ports.as_deref().unwrap_or_default(),
            keep_node_ports,
        );

        let mut changed = false;
        if spec.selector != wanted.selector {
            spec.selector.clone_from(&wanted.selector);
            changed = true;
        }
        if spec.type_ != wanted.type_ {
            spec.type_.clone_from(&wanted.type_);
            changed = true;
        }
        // A NodePort port without an allocation is rewritten so the platform assigns one
        let unallocated = keep_node_ports && ports.iter().any(|p| p.node_port.unwrap_or(0) == 0);
        if spec.ports.as_ref() != Some(&ports) || unallocated {
            spec.ports = Some(ports);
            changed = true;
        }
        if !labels_cover(live.metadata.labels.as_ref(), desired.metadata.labels.as_ref()) {
            let labels = live.metadata.labels.get_or_insert_with(BTreeMap::new);
            labels.extend(desired.metadata.labels.clone().unwrap_or_default());
            changed = true;
        }

        if changed {
            info!(namespace = %namespace, service = %name, "Updating service");
            self.client.update_service(&live).await?;
        }
        Ok(())
    }

    fn gateway_env(&self, devbox: &Devbox, ports: &[ServicePort]) -> Result<Vec<EnvVar>, ControllerError> {
        let (namespace, name) = devbox_key(devbox);
        let auto_shutdown = devbox.spec.auto_shutdown_spec.enable && self.config.enable_auto_shutdown;

        let mut envs = vec![env("ENABLE_AUTO_SHUTDOWN", auto_shutdown.to_string())];
        if auto_shutdown {
            envs.push(env(
                "AUTO_SHUTDOWN_INTERVAL",
                devbox.spec.auto_shutdown_spec.time.clone().unwrap_or_default(),
            ));
        }
        let token = sign_gateway_token(
            &name,
            &namespace,
            &self.config.shutdown_server_key,
            chrono::Utc::now().timestamp(),
        )?;
        envs.push(env("JWT_TOKEN", token));
        envs.push(env(
            "TARGET",
            format!("{}:{}", pod_service_name(&name), ssh_target_port(ports)),
        ));
        envs.push(env("LISTEN", format!("0.0.0.0:{PROXY_PORT}")));
        envs.push(env("AUTO_SHUTDOWN_SERVICE_URL", self.config.shutdown_server_addr.clone()));
        Ok(envs)
    }

    fn gateway_deployment(&self, devbox: &Devbox, ports: &[ServicePort]) -> Result<Deployment, ControllerError> {
        let (_, name) = devbox_key(devbox);
        let image = self
            .config
            .websocket_image
            .clone()
            .ok_or(ControllerError::MissingProxyImage)?;
        let labels = proxy_labels(&name);

        Ok(Deployment {
            metadata: child_meta(devbox, proxy_deployment_name(&name), labels.clone()),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: PROXY_CONTAINER.to_string(),
                            image: Some(image),
                            env: Some(self.gateway_env(devbox, ports)?),
                            ports: Some(vec![ContainerPort {
                                container_port: PROXY_PORT,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            }]),
                            resources: Some(proxy_resources()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn sync_proxy_deployment(&self, devbox: &Devbox, ports: &[ServicePort]) -> Result<(), ControllerError> {
        let (namespace, name) = devbox_key(devbox);
        let wanted = self.gateway_deployment(devbox, ports)?;
        let deployment_name = proxy_deployment_name(&name);

        match self.client.get_deployment(&namespace, &deployment_name).await? {
            None => match self.client.create_deployment(&wanted).await {
                Ok(_) => {
                    info!(namespace = %namespace, name = %name, "Created gateway deployment");
                    Ok(())
                }
                Err(e) if e.is_already_exists() => Ok(()),
                Err(e) => Err(e.into()),
            },
            Some(mut live) if gateway_drifted(&live, &wanted) => {
                info!(namespace = %namespace, name = %name, "Updating gateway deployment");
                live.spec = wanted.spec;
                self.client.update_deployment(&live).await?;
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Host previously published in status, if it belongs to the proxy domain
    fn published_host(&self, devbox: &Devbox) -> Option<String> {
        let suffix = format!(".{}", self.config.websocket_proxy_domain);
        devbox
            .status
            .as_ref()
            .and_then(|s| s.network.web_socket_host.clone())
            .filter(|host| host.ends_with(&suffix))
    }

    fn gateway_ingress(&self, devbox: &Devbox, host: String) -> Ingress {
        let (_, name) = devbox_key(devbox);
        let mut metadata = child_meta(devbox, proxy_ingress_name(&name), proxy_labels(&name));
        metadata.annotations = Some(
            INGRESS_TIMEOUT_ANNOTATIONS
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );

        Ingress {
            metadata,
            spec: Some(IngressSpec {
                ingress_class_name: Some(self.config.ingress_class.clone()),
                rules: Some(vec![IngressRule {
                    host: Some(host),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: proxy_service_name(&name),
                                    port: Some(ServiceBackendPort {
                                        number: Some(PROXY_PORT),
                                        name: None,
                                    }),
                                }),
                                resource: None,
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Upsert the gateway ingress and return its host
    async fn sync_proxy_ingress(&self, devbox: &Devbox) -> Result<String, ControllerError> {
        let (namespace, name) = devbox_key(devbox);
        let ingress_name = proxy_ingress_name(&name);
        let live = self.client.get_ingress(&namespace, &ingress_name).await?;

        let host = live
            .as_ref()
            .and_then(ingress_host)
            .or_else(|| self.published_host(devbox))
            .unwrap_or_else(|| {
                format!(
                    "{}.{}",
                    random_suffix(HOST_PREFIX_LENGTH),
                    self.config.websocket_proxy_domain
                )
            });
        let wanted = self.gateway_ingress(devbox, host.clone());

        match live {
            None => match self.client.create_ingress(&wanted).await {
                Ok(_) => info!(namespace = %namespace, name = %name, host = %host, "Created gateway ingress"),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            },
            Some(mut live) => {
                let annotations_ok = labels_cover(live.metadata.annotations.as_ref(), wanted.metadata.annotations.as_ref());
                if live.spec != wanted.spec || !annotations_ok {
                    info!(namespace = %namespace, name = %name, "Updating gateway ingress");
                    live.spec = wanted.spec;
                    live.metadata
                        .annotations
                        .get_or_insert_with(BTreeMap::new)
                        .extend(wanted.metadata.annotations.unwrap_or_default());
                    if live.metadata.owner_references.is_none() {
                        live.metadata.owner_references = Some(owner_references(devbox));
                    }
                    self.client.update_ingress(&live).await?;
                }
            }
        }
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: Option<&str>, number: i32, node_port: Option<i32>) -> ServicePort {
        ServicePort {
            name: name.map(str::to_string),
            port: number,
            node_port,
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_ports_keeps_allocated_node_port() {
        let live = vec![port(Some("ssh"), 22, Some(30022))];
        let wanted = vec![port(Some("ssh"), 22, None), port(Some("http"), 8080, None)];

        let merged = merge_ports(&live, &wanted, true);
        assert_eq!(merged[0].node_port, Some(30022));
        assert_eq!(merged[1].node_port, None);

        // Switching away from NodePort drops allocations
        let merged = merge_ports(&live, &wanted, false);
        assert_eq!(merged[0].node_port, None);
    }

    #[test]
    fn test_ssh_target_port() {
        assert_eq!(ssh_target_port(&[]), 22);
        assert_eq!(ssh_target_port(&[port(Some("web"), 8080, None)]), 8080);

        let mut ssh = port(Some(SSH_PORT_NAME), 2222, None);
        ssh.target_port = Some(IntOrString::Int(22));
        assert_eq!(ssh_target_port(&[port(Some("web"), 8080, None), ssh]), 22);
    }

    #[test]
    fn test_service_ports_default_and_dedup() {
        let runtime = Runtime::new("go", crds::RuntimeSpec::default());
        let ports = service_ports(&runtime, &[]);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some(SSH_PORT_NAME));
        assert_eq!(ports[0].port, 22);

        let extra = vec![
            ContainerPort {
                container_port: 8080,
                ..Default::default()
            },
            ContainerPort {
                container_port: 8080,
                name: Some("dup".to_string()),
                ..Default::default()
            },
        ];
        let ports = service_ports(&runtime, &extra);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("port-8080"));
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
    }
}
