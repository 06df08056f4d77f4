//! GPU exporter memory poller.
//!
//! The DCGM exporter sidecar leaks memory under some driver versions, so
//! the operator polls the node helper for container stats and restarts
//! (deletes) exporter pods whose working-set memory crosses the eviction
//! threshold. Working-set is usage minus reclaimable page cache
//! (`inactive_file`), the same metric the kubelet evicts on.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SightlineError};

/// Label selector for pods carrying the GPU exporter sidecar.
pub const GPU_POD_SELECTOR: &str = "sightline-gpu=true";
pub const EXPORTER_CONTAINER_NAME: &str = "dcgm-exporter";
const HELPER_PORT: u16 = 6801;

/// Working-set above this fraction of the limit restarts the pod.
pub const MEMORY_EVICT_RATIO: f64 = 0.7;

#[derive(Debug, Deserialize)]
pub struct ContainerStatsResponse {
    pub memory_stats: MemoryStats,
}

#[derive(Debug, Default, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub stats: MemoryStatsDetail,
}

#[derive(Debug, Default, Deserialize)]
pub struct MemoryStatsDetail {
    #[serde(default)]
    pub inactive_file: u64,
    #[serde(default)]
    pub rss: u64,
}

#[derive(Debug, Deserialize)]
pub struct ContainerMeta {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "MemoryLimit", default)]
    pub memory_limit: String,
}

/// Working-set memory: usage minus reclaimable cache.
pub fn working_set(usage: u64, inactive_file: u64) -> u64 {
    usage.saturating_sub(inactive_file)
}

pub fn should_evict(working_set: u64, limit: u64) -> bool {
    if limit == 0 {
        return false;
    }
    (working_set as f64) / (limit as f64) > MEMORY_EVICT_RATIO
}

/// Parses Kubernetes quantity strings ("170Mi", "16069016Ki", "2G") into
/// bytes. Returns None for malformed input.
pub fn parse_quantity(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    for (suffix, multiplier) in [
        ("Ki", 1u64 << 10),
        ("Mi", 1u64 << 20),
        ("Gi", 1u64 << 30),
        ("Ti", 1u64 << 40),
    ] {
        if let Some(number) = value.strip_suffix(suffix) {
            return number.parse::<u64>().ok().map(|n| n * multiplier);
        }
    }
    for (suffix, multiplier) in [
        ("k", 1_000u64),
        ("M", 1_000_000u64),
        ("G", 1_000_000_000u64),
        ("T", 1_000_000_000_000u64),
    ] {
        if let Some(number) = value.strip_suffix(suffix) {
            return number.parse::<u64>().ok().map(|n| n * multiplier);
        }
    }
    value.parse::<u64>().ok()
}

pub struct GpuMemoryChecker {
    client: Client,
    http: reqwest::Client,
    interval: Duration,
}

impl GpuMemoryChecker {
    pub fn new(client: Client, interval: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SightlineError::Config(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            client,
            http,
            interval,
        })
    }

    /// Polls until cancelled by process shutdown.
    pub async fn run(self) {
        info!(interval = ?self.interval, "starting GPU memory checker");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            self.check_exporter_pods().await;
        }
    }

    async fn check_exporter_pods(&self) {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = match pods
            .list(&ListParams::default().labels(GPU_POD_SELECTOR))
            .await
        {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "failed to list GPU exporter pods");
                return;
            }
        };

        debug!(count = list.items.len(), "checking GPU exporter pods");
        for pod in &list.items {
            if let Err(e) = self.check_pod(pod).await {
                debug!(pod = %pod.name_any(), error = %e, "GPU memory check skipped");
            }
        }
    }

    async fn check_pod(&self, pod: &Pod) -> Result<()> {
        if pod.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }
        let status = pod.status.as_ref();
        if status.and_then(|s| s.phase.as_deref()) != Some("Running") {
            return Ok(());
        }

        let container_id = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| {
                statuses
                    .iter()
                    .find(|cs| cs.name == EXPORTER_CONTAINER_NAME)
                    .and_then(|cs| cs.container_id.clone())
            });
        let Some(container_id) = container_id else {
            return Ok(());
        };
        // Strip the runtime prefix (containerd://, docker://, ...).
        let container_id = container_id
            .split_once("://")
            .map(|(_, id)| id.to_string())
            .unwrap_or(container_id);

        let Some(pod_ip) = status.and_then(|s| s.pod_ip.clone()) else {
            return Ok(());
        };

        let stats = self.fetch_memory_stats(&pod_ip, &container_id).await?;
        let limit = self.fetch_container_limit(&pod_ip, &container_id).await?;
        if limit == 0 {
            return Ok(());
        }

        let working_set = working_set(stats.memory_stats.usage, stats.memory_stats.stats.inactive_file);
        if should_evict(working_set, limit) {
            info!(
                pod = %pod.name_any(),
                namespace = %pod.namespace().unwrap_or_default(),
                working_set,
                limit,
                "GPU exporter memory above threshold, restarting pod"
            );
            let namespace = pod.namespace().unwrap_or_default();
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            if let Err(e) = pods.delete(&pod.name_any(), &DeleteParams::default()).await {
                warn!(pod = %pod.name_any(), error = %e, "failed to delete exporter pod");
            }
        }
        Ok(())
    }

    async fn fetch_memory_stats(
        &self,
        pod_ip: &str,
        container_id: &str,
    ) -> Result<ContainerStatsResponse> {
        let url = format!("http://{pod_ip}:{HELPER_PORT}/container/{container_id}/stats");
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SightlineError::GpuHelper(format!(
                "unexpected status {} from {url}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn fetch_container_limit(&self, pod_ip: &str, container_id: &str) -> Result<u64> {
        let url = format!("http://{pod_ip}:{HELPER_PORT}/container");
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SightlineError::GpuHelper(format!(
                "unexpected status {} from {url}",
                response.status()
            )));
        }
        let containers: Vec<ContainerMeta> = response.json().await?;
        let meta = containers
            .into_iter()
            .find(|c| c.id == container_id)
            .ok_or_else(|| {
                SightlineError::GpuHelper(format!("container {container_id} not in helper metadata"))
            })?;
        if meta.memory_limit.is_empty() || meta.memory_limit == "0" {
            return Ok(0);
        }
        parse_quantity(&meta.memory_limit).ok_or_else(|| {
            SightlineError::GpuHelper(format!("unparseable memory limit '{}'", meta.memory_limit))
        })
    }
}
