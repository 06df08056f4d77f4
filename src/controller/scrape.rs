//! Scrape-config emission.
//!
//! Renders the nested YAML document the open-agent process consumes:
//! global settings plus one entry per enabled scrape target, and an
//! automatic GPU exporter target when GPU monitoring is on. Pure
//! templating, no cluster access.

use serde_json::{json, Value};

use crate::crd::{GpuMonitoringSpec, OpenAgentTargetSpec, SightlineAgentSpec};
use crate::error::Result;

pub fn generate(spec: &SightlineAgentSpec) -> Result<String> {
    let mut targets: Vec<Value> = Vec::new();

    for target in spec
        .features
        .open_agent
        .targets
        .iter()
        .filter(|t| t.enabled)
    {
        targets.push(render_target(target)?);
    }

    let gpu = &spec.features.k8s_agent.gpu_monitoring;
    if gpu.enabled {
        targets.push(gpu_auto_target(gpu));
    }

    let document = json!({
        "global": {
            "scrapeInterval": "60s",
        },
        "targets": targets,
    });

    Ok(serde_yaml::to_string(&document)?)
}

fn render_target(target: &OpenAgentTargetSpec) -> Result<Value> {
    let mut entry = json!({
        "targetName": target.target_name,
        "type": target.target_type.as_str(),
        "enabled": true,
        "endpoints": serde_json::to_value(&target.endpoints)?,
    });

    if !target.namespace_selector.match_names.is_empty()
        || !target.namespace_selector.match_labels.is_empty()
        || !target.namespace_selector.match_expressions.is_empty()
    {
        entry["namespaceSelector"] = serde_json::to_value(&target.namespace_selector)?;
    }
    if !target.selector.match_labels.is_empty() || !target.selector.match_expressions.is_empty() {
        entry["selector"] = serde_json::to_value(&target.selector)?;
    }
    if let Some(job_label) = target.job_label.as_deref().filter(|l| !l.is_empty()) {
        entry["relabelConfigs"] = json!([{
            "source_labels": [format!("__meta_kube_pod_label_{job_label}")],
            "target_label": "job",
            "action": "replace",
        }]);
    }

    Ok(entry)
}

/// The GPU exporter sidecar is scraped through a fixed pod-label target so
/// enabling GPU monitoring needs no extra scrape configuration.
fn gpu_auto_target(gpu: &GpuMonitoringSpec) -> Value {
    let interval = gpu.interval.as_deref().filter(|i| !i.is_empty()).unwrap_or("30s");
    let mut relabel_configs: Vec<Value> = Vec::new();

    if let Some(group_label) = gpu.group_label.as_deref().filter(|l| !l.is_empty()) {
        relabel_configs.push(json!({
            "source_labels": [format!("__meta_kube_pod_label_{group_label}")],
            "target_label": "sightline_kube_label_gpu_group",
            "action": "replace",
        }));
    }
    if let Some(cluster) = gpu.cluster_name.as_deref().filter(|c| !c.is_empty()) {
        relabel_configs.push(json!({
            "target_label": "cluster",
            "replacement": cluster,
            "action": "replace",
        }));
    }

    let mut entry = json!({
        "targetName": "dcgm-exporter-auto",
        "type": "PodMonitor",
        "enabled": true,
        "selector": {
            "matchLabels": { "sightline-gpu": "true" },
        },
        "endpoints": [{
            "port": "9400",
            "path": "/metrics",
            "interval": interval,
        }],
    });
    if !relabel_configs.is_empty() {
        entry["relabelConfigs"] = Value::Array(relabel_configs);
    }
    entry
}
