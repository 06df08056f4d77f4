//! sightline-operator - Kubernetes operator for Sightline monitoring
//!
//! The operator:
//! - Reconciles the cluster-scoped SightlineAgent record into managed
//!   agent workloads, RBAC and webhook registrations
//! - Mutates incoming pods at admission time to inject APM agents
//! - Bootstraps the webhook TLS certificate at startup
//! - Optionally polls GPU exporter memory and restarts leaky pods

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sightline_operator::certs::WebhookCertificate;
use sightline_operator::config::OperatorConfig;
use sightline_operator::controller;
use sightline_operator::gpu::GpuMemoryChecker;
use sightline_operator::webhook::{self, WebhookContext};

#[derive(Parser, Debug)]
#[command(name = "sightline-operator", version, about = "Sightline monitoring operator")]
struct Args {
    /// Port the admission HTTPS listener binds.
    #[arg(long, default_value_t = 9443)]
    webhook_port: u16,

    /// Directory the bootstrapped certificate material is written to.
    #[arg(long, default_value = "/etc/webhook/certs")]
    cert_dir: PathBuf,

    /// Monitor GPU exporter memory and restart pods above the threshold.
    #[arg(long)]
    enable_gpu_memory_check: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!("Starting sightline-operator v{}", sightline_operator::VERSION);

    let mut config = OperatorConfig::from_env();
    config.webhook_port = args.webhook_port;
    config.cert_dir = args.cert_dir.clone();
    config.gpu_memory_check = config.gpu_memory_check || args.enable_gpu_memory_check;

    // One certificate per process lifetime; the reconciler persists it
    // into the TLS Secret and webhook registrations.
    let certs =
        WebhookCertificate::generate(&config.webhook_service_name, &config.default_namespace)
            .context("failed to bootstrap webhook certificate")?;
    certs
        .write_to_dir(&config.cert_dir)
        .context("failed to write certificate material")?;
    info!(dir = %config.cert_dir.display(), "webhook certificate bootstrapped");

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    if config.enable_webhooks {
        let router = webhook::router(Arc::new(WebhookContext {
            client: client.clone(),
            config: config.clone(),
        }));
        let addr = SocketAddr::from(([0, 0, 0, 0], config.webhook_port));
        let server_certs = certs.clone();
        tokio::spawn(async move {
            if let Err(e) = webhook::serve(router, addr, &server_certs).await {
                warn!(error = %e, "admission webhook server exited");
            }
        });
    } else {
        info!("admission webhooks disabled");
    }

    if config.gpu_memory_check {
        let checker = GpuMemoryChecker::new(client.clone(), config.gpu_check_interval)
            .context("failed to start GPU memory checker")?;
        tokio::spawn(checker.run());
    }

    controller::run(Arc::new(controller::Context {
        client,
        config,
        certs,
    }))
    .await;

    info!("sightline-operator stopped");
    Ok(())
}
