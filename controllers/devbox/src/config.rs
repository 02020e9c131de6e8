//! Startup configuration.
//!
//! Read once from the environment in `main` and shared read-only with every
//! component through `Arc<ControllerConfig>`.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::str::FromStr;

/// Process-wide controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Registry commit images are pushed to
    pub commit_image_registry: String,
    /// CPU request = limit / rate
    pub request_cpu_rate: f64,
    /// Memory request = limit / rate
    pub request_memory_rate: f64,
    pub request_ephemeral_storage: String,
    pub limit_ephemeral_storage: String,
    /// Image of the websocket gateway; required for WebSocket mode
    pub websocket_image: Option<String>,
    /// Start pods from the runtime image instead of the last commit
    pub debug_mode: bool,
    /// Domain suffix for generated ingress hosts
    pub websocket_proxy_domain: String,
    pub ingress_class: String,
    /// Controller-wide switch for gateway auto-shutdown
    pub enable_auto_shutdown: bool,
    pub shutdown_server_addr: String,
    /// HMAC key for gateway tokens
    pub shutdown_server_key: String,
    /// Restrict the controller to one namespace
    pub watch_namespace: Option<String>,
    pub concurrency: u16,
    /// Cap of the per-devbox error backoff
    pub requeue_max_seconds: u64,
    pub metrics_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            commit_image_registry: "registry.local".to_string(),
            request_cpu_rate: 10.0,
            request_memory_rate: 10.0,
            request_ephemeral_storage: "500Mi".to_string(),
            limit_ephemeral_storage: "10Gi".to_string(),
            websocket_image: None,
            debug_mode: false,
            websocket_proxy_domain: "devbox.local".to_string(),
            ingress_class: "nginx".to_string(),
            enable_auto_shutdown: false,
            shutdown_server_addr: String::new(),
            shutdown_server_key: String::new(),
            watch_namespace: None,
            concurrency: 8,
            requeue_max_seconds: 300,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            commit_image_registry: get("COMMIT_IMAGE_REGISTRY")
                .unwrap_or(defaults.commit_image_registry),
            request_cpu_rate: parse_or(get("REQUEST_CPU_RATE"), "REQUEST_CPU_RATE", defaults.request_cpu_rate)?,
            request_memory_rate: parse_or(
                get("REQUEST_MEMORY_RATE"),
                "REQUEST_MEMORY_RATE",
                defaults.request_memory_rate,
            )?,
            request_ephemeral_storage: get("REQUEST_EPHEMERAL_STORAGE")
                .unwrap_or(defaults.request_ephemeral_storage),
            limit_ephemeral_storage: get("LIMIT_EPHEMERAL_STORAGE")
                .unwrap_or(defaults.limit_ephemeral_storage),
            websocket_image: get("WEBSOCKET_IMAGE"),
            debug_mode: parse_bool(get("DEBUG_MODE"), "DEBUG_MODE", defaults.debug_mode)?,
            websocket_proxy_domain: get("WEBSOCKET_PROXY_DOMAIN")
                .unwrap_or(defaults.websocket_proxy_domain),
            ingress_class: get("INGRESS_CLASS").unwrap_or(defaults.ingress_class),
            enable_auto_shutdown: parse_bool(
                get("ENABLE_AUTO_SHUTDOWN"),
                "ENABLE_AUTO_SHUTDOWN",
                defaults.enable_auto_shutdown,
            )?,
            shutdown_server_addr: get("SHUTDOWN_SERVER_ADDR").unwrap_or_default(),
            shutdown_server_key: get("SHUTDOWN_SERVER_KEY").unwrap_or_default(),
            watch_namespace: get("WATCH_NAMESPACE"),
            concurrency: parse_or(get("CONTROLLER_CONCURRENCY"), "CONTROLLER_CONCURRENCY", defaults.concurrency)?,
            requeue_max_seconds: parse_or(
                get("REQUEUE_MAX_SECONDS"),
                "REQUEUE_MAX_SECONDS",
                defaults.requeue_max_seconds,
            )?,
            metrics_addr: parse_or(get("METRICS_ADDR"), "METRICS_ADDR", defaults.metrics_addr)?,
        };

        let valid_rate = |rate: f64| rate > 0.0 && rate.is_finite();
        if !valid_rate(config.request_cpu_rate) || !valid_rate(config.request_memory_rate) {
            return Err(ControllerError::InvalidConfig(
                "REQUEST_CPU_RATE and REQUEST_MEMORY_RATE must be positive and finite".to_string(),
            ));
        }
        if config.concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "CONTROLLER_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, ControllerError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ControllerError::InvalidConfig(format!("{key}={raw} is not valid"))),
    }
}

fn parse_bool(value: Option<String>, key: &str, default: bool) -> Result<bool, ControllerError> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes") => Ok(true),
        Some(v) if matches!(v.as_str(), "false" | "0" | "no") => Ok(false),
        Some(v) => Err(ControllerError::InvalidConfig(format!("{key}={v} is not a boolean"))),
    }
}
