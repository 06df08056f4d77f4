//! Operator configuration.
//!
//! Built once at startup and passed explicitly to the webhook handlers and
//! the reconciler; there is no global configuration state.

use std::path::PathBuf;
use std::time::Duration;

use crate::crd::DEFAULT_NAMESPACE;

/// Name of the Service fronting the admission endpoints.
pub const WEBHOOK_SERVICE_NAME: &str = "sightline-admission";

/// Path of the namespace file mounted into every pod's service-account
/// volume.
const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace for managed workloads when the record does not name one;
    /// also the namespace the admission Service lives in.
    pub default_namespace: String,
    /// Name of the Service fronting the admission endpoints.
    pub webhook_service_name: String,
    /// Port the admission HTTPS listener binds.
    pub webhook_port: u16,
    /// Directory the bootstrapped certificate material is written to.
    pub cert_dir: PathBuf,
    /// When false the admission endpoints are not served and webhook
    /// registrations are not reconciled.
    pub enable_webhooks: bool,
    /// Enables the GPU exporter memory poller.
    pub gpu_memory_check: bool,
    /// Poll interval for the GPU exporter memory poller.
    pub gpu_check_interval: Duration,
}

impl OperatorConfig {
    /// Reads configuration from the environment, falling back to the
    /// in-cluster service-account namespace and then to the built-in
    /// default namespace.
    pub fn from_env() -> Self {
        let default_namespace = std::env::var("SIGHTLINE_DEFAULT_NAMESPACE")
            .ok()
            .filter(|ns| !ns.is_empty())
            .or_else(service_account_namespace)
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let enable_webhooks = std::env::var("ENABLE_WEBHOOKS")
            .map(|v| v != "false")
            .unwrap_or(true);

        let gpu_memory_check = std::env::var("SIGHTLINE_GPU_MEMORY_CHECK")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(false);

        Self {
            default_namespace,
            webhook_service_name: WEBHOOK_SERVICE_NAME.to_string(),
            webhook_port: 9443,
            cert_dir: PathBuf::from("/etc/webhook/certs"),
            enable_webhooks,
            gpu_memory_check,
            gpu_check_interval: Duration::from_secs(30),
        }
    }
}

fn service_account_namespace() -> Option<String> {
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE)
        .ok()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
}
