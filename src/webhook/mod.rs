//! Admission webhook surface.
//!
//! One HTTPS listener serves both admission endpoints with the
//! bootstrapped certificate: pod mutation on `/inject-pod` and record
//! validation on `/validate-agent`. Both webhooks are registered with
//! failure policy Ignore, so an unreachable listener degrades to
//! unmodified admission rather than blocking the cluster.

pub mod mutate;
pub mod validate;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use kube::Client;
use tracing::info;

use crate::certs::WebhookCertificate;
use crate::config::OperatorConfig;
use crate::error::{Result, SightlineError};

/// Shared state for the admission handlers.
pub struct WebhookContext {
    pub client: Client,
    pub config: OperatorConfig,
}

pub const MUTATE_POD_PATH: &str = "/inject-pod";
pub const VALIDATE_AGENT_PATH: &str = "/validate-agent";

pub fn router(ctx: Arc<WebhookContext>) -> Router {
    Router::new()
        .route(MUTATE_POD_PATH, post(mutate::mutate_pod))
        .route(VALIDATE_AGENT_PATH, post(validate::validate_agent))
        .route("/healthz", get(healthz))
        .with_state(ctx)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serves the admission endpoints until the process exits.
pub async fn serve(router: Router, addr: SocketAddr, certs: &WebhookCertificate) -> Result<()> {
    let tls_config = RustlsConfig::from_pem(
        certs.server_cert_pem.clone().into_bytes(),
        certs.server_key_pem.clone().into_bytes(),
    )
    .await
    .map_err(|e| SightlineError::WebhookServer(format!("TLS config error: {e}")))?;

    info!(%addr, "starting admission webhook server");

    axum_server::bind_rustls(addr, tls_config)
        .serve(router.into_make_service())
        .await
        .map_err(|e| SightlineError::WebhookServer(e.to_string()))
}
