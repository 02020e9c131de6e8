//! Labels, annotations and object names for everything derived from a devbox.
//!
//! Devbox pods and services carry the recommended label set with
//! `part-of=devbox`; gateway objects use `part-of=devbox-proxy` so the pod
//! selector never matches gateway pods.

use cluster_client::Labels;

pub const FINALIZER: &str = "devbox.microscaler.io/finalizer";
pub const MANAGER: &str = "devbox-controller";

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const RUNTIME_LABEL: &str = "devbox.microscaler.io/runtime";

pub const PART_OF_DEVBOX: &str = "devbox";
pub const PART_OF_PROXY: &str = "devbox-proxy";

pub const COMMIT_IMAGE_ANNOTATION: &str = "devbox.microscaler.io/commit-image";
pub const RUNTIME_ANNOTATION: &str = "devbox.microscaler.io/runtime";

/// Selector used to restrict watches of owned objects
pub fn managed_by_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGER}")
}

fn label_set(devbox_name: &str, part_of: &str) -> Labels {
    Labels::from([
        (NAME_LABEL.to_string(), devbox_name.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGER.to_string()),
        (PART_OF_LABEL.to_string(), part_of.to_string()),
    ])
}

/// Labels of the secret, pod and pod-facing services of a devbox
pub fn recommended_labels(devbox_name: &str) -> Labels {
    label_set(devbox_name, PART_OF_DEVBOX)
}

/// Labels of the gateway deployment, its pods, service and ingress
pub fn proxy_labels(devbox_name: &str) -> Labels {
    label_set(devbox_name, PART_OF_PROXY)
}

pub fn pod_labels(devbox_name: &str, runtime_name: &str) -> Labels {
    let mut labels = recommended_labels(devbox_name);
    labels.insert(RUNTIME_LABEL.to_string(), runtime_name.to_string());
    labels
}

pub fn secret_name(devbox_name: &str) -> String {
    devbox_name.to_string()
}

pub fn node_port_service_name(devbox_name: &str) -> String {
    format!("{devbox_name}-svc")
}

pub fn pod_service_name(devbox_name: &str) -> String {
    format!("{devbox_name}-pod-svc")
}

pub fn proxy_deployment_name(devbox_name: &str) -> String {
    format!("{devbox_name}-proxy-deployment")
}

pub fn proxy_service_name(devbox_name: &str) -> String {
    format!("{devbox_name}-proxy-svc")
}

pub fn proxy_ingress_name(devbox_name: &str) -> String {
    format!("{devbox_name}-proxy-ingress")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_and_proxy_labels_do_not_overlap() {
        let pod = pod_labels("box", "go-1-22");
        let proxy = proxy_labels("box");

        // A selector built from the recommended set must not match gateway pods
        let matches_proxy = recommended_labels("box")
            .iter()
            .all(|(k, v)| proxy.get(k) == Some(v));
        assert!(!matches_proxy);
        assert_eq!(pod.get(RUNTIME_LABEL).map(String::as_str), Some("go-1-22"));
    }

    #[test]
    fn test_keys_live_in_the_crd_group() {
        let prefix = format!("{}/", <crds::Devbox as kube::Resource>::group(&()));
        for key in [FINALIZER, RUNTIME_LABEL, COMMIT_IMAGE_ANNOTATION, RUNTIME_ANNOTATION] {
            assert!(key.starts_with(&prefix), "{key}");
        }
    }

    #[test]
    fn test_object_names() {
        assert_eq!(secret_name("box"), "box");
        assert_eq!(node_port_service_name("box"), "box-svc");
        assert_eq!(pod_service_name("box"), "box-pod-svc");
        assert_eq!(proxy_deployment_name("box"), "box-proxy-deployment");
        assert_eq!(proxy_service_name("box"), "box-proxy-svc");
        assert_eq!(proxy_ingress_name("box"), "box-proxy-ingress");
        assert_eq!(managed_by_selector(), "app.kubernetes.io/managed-by=devbox-controller");
    }
}
