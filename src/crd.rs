//! SightlineAgent custom resource definition.
//!
//! The cluster-scoped `SightlineAgent` record is the single declarative
//! source of truth for everything the operator manages: connection
//! credentials, APM instrumentation targets, the Kubernetes agent
//! components and the open-agent scraper. The operator only ever writes
//! the status subresource; the spec is owned by the record's author.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Affinity, EnvVar, LocalObjectReference, Toleration};
use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Expected name of the cluster-wide singleton record.
pub const AGENT_RESOURCE_NAME: &str = "sightline";

/// Namespace used for managed workloads when the record does not name one.
pub const DEFAULT_NAMESPACE: &str = "sightline-monitoring";

fn default_true() -> bool {
    true
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(
    group = "monitoring.sightline.io",
    version = "v1alpha1",
    kind = "SightlineAgent",
    status = "SightlineAgentStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct SightlineAgentSpec {
    /// License key for the Sightline collection servers.
    #[serde(default)]
    pub license: String,
    /// Collection server host.
    #[serde(default)]
    pub host: String,
    /// Collection server port.
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub features: FeaturesSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesSpec {
    #[serde(default)]
    pub apm: ApmSpec,
    #[serde(default)]
    pub open_agent: OpenAgentSpec,
    #[serde(default)]
    pub k8s_agent: K8sAgentSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApmSpec {
    #[serde(default)]
    pub instrumentation: InstrumentationSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Security-context defaults for injected init containers; a target may
    /// override these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_container_security: Option<InitContainerSecuritySpec>,
    /// Evaluated in declaration order; the first matching target wins.
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

/// Supported instrumentation languages. Adding a language is a
/// compile-time-visible change: every dispatch site must handle it.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Java,
    Python,
    Nodejs,
    Php,
    Dotnet,
    Golang,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Java => "java",
            Language::Python => "python",
            Language::Nodejs => "nodejs",
            Language::Php => "php",
            Language::Dotnet => "dotnet",
            Language::Golang => "golang",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub language: Language,
    /// Agent version per language; the entry for `language` must exist for
    /// planning to succeed.
    #[serde(default)]
    pub apm_versions: BTreeMap<Language, String>,
    /// Full image reference override for the init image. Takes precedence
    /// over `customImageName` and the built-in default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image_full_name: Option<String>,
    /// Image name override; combined with the language version as the tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image_name: Option<String>,
    /// Extra `key=value` entries appended to the generated agent config.
    #[serde(default)]
    pub additional_args: BTreeMap<String, String>,
    /// Extra env vars for application containers. Existing container entries
    /// take precedence.
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    #[serde(default)]
    pub namespace_selector: NamespaceSelector,
    #[serde(default)]
    pub pod_selector: PodSelector,
    #[serde(default)]
    pub config: ConfigSpec,
    /// Overrides the instrumentation-level init-container security settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_container_security: Option<InitContainerSecuritySpec>,
    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitContainerSecuritySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
}

/// Matches namespaces by name, labels or expressions; all clauses are
/// conjunctive and empty clauses are vacuously true.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default)]
    pub match_names: Vec<String>,
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    #[serde(default)]
    pub mode: ConfigMode,
    /// Required when `mode` is `custom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<ConfigMapRef>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigMode {
    #[default]
    Default,
    Custom,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct K8sAgentSpec {
    /// Namespace for the managed agent workloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_image_version: Option<String>,
    /// Full image reference override; takes precedence over the
    /// name/version pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image_full_name: Option<String>,
    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(default)]
    pub master_agent: MasterAgentSpec,
    #[serde(default)]
    pub node_agent: NodeAgentSpec,
    #[serde(default)]
    pub gpu_monitoring: GpuMonitoringSpec,
    #[serde(default)]
    pub apiserver_monitoring: MonitorStubSpec,
    #[serde(default)]
    pub etcd_monitoring: MonitorStubSpec,
    #[serde(default)]
    pub scheduler_monitoring: MonitorStubSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct MasterAgentSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_annotations: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeAgentSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_annotations: BTreeMap<String, String>,
    /// Container runtime whose domain socket the node helper mounts.
    #[serde(default)]
    pub runtime: ContainerRuntime,
    /// Overrides the host path of the selected runtime's socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_socket_path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Containerd,
    Docker,
    Crio,
}

impl ContainerRuntime {
    /// Default host path of the runtime's domain socket.
    pub fn socket_path(&self) -> &'static str {
        match self {
            ContainerRuntime::Containerd => "/run/containerd/containerd.sock",
            ContainerRuntime::Docker => "/var/run/docker.sock",
            ContainerRuntime::Crio => "/var/run/crio/crio.sock",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GpuMonitoringSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image_full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<GpuServiceSpec>,
    /// Pod label key whose value groups GPU metrics in scrape output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_label: Option<String>,
    /// Cluster name stamped onto GPU metrics in scrape output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    /// Scrape interval for the GPU exporter target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

fn default_gpu_port() -> i32 {
    9400
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GpuServiceSpec {
    #[serde(default)]
    pub enabled: bool,
    /// ClusterIP, NodePort or LoadBalancer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
    #[serde(default = "default_gpu_port")]
    pub port: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStubSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image_full_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenAgentSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub targets: Vec<OpenAgentTargetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image_full_name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    /// When true the agent runs as a daemon instead of in the foreground.
    #[serde(default)]
    pub disable_foreground: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OpenAgentTargetSpec {
    pub target_name: String,
    #[serde(rename = "type")]
    pub target_type: ScrapeTargetType,
    #[serde(default)]
    pub namespace_selector: NamespaceSelector,
    #[serde(default)]
    pub selector: PodSelector,
    #[serde(default)]
    pub endpoints: Vec<ScrapeEndpoint>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Label whose value becomes the Prometheus `job` label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_label: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrapeTargetType {
    ServiceMonitor,
    PodMonitor,
    StaticEndpoints,
}

impl ScrapeTargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeTargetType::ServiceMonitor => "ServiceMonitor",
            ScrapeTargetType::PodMonitor => "PodMonitor",
            ScrapeTargetType::StaticEndpoints => "StaticEndpoints",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Static address, for `StaticEndpoints` targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub metric_relabel_configs: Vec<RelabelConfig>,
    #[serde(default)]
    pub add_node_label: bool,
}

/// Prometheus-style relabel rule. Field names follow the Prometheus wire
/// format, not camelCase.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct RelabelConfig {
    #[serde(default)]
    pub source_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SightlineAgentStatus {
    #[serde(default)]
    pub conditions: Vec<AgentCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False".
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_defaults_from_minimal_yaml() {
        let yaml = r#"
name: backend
language: java
"#;
        let target: TargetSpec = serde_yaml::from_str(yaml).expect("minimal target parses");
        assert!(target.enabled, "targets default to enabled");
        assert_eq!(target.language, Language::Java);
        assert_eq!(target.config.mode, ConfigMode::Default);
        assert!(target.pod_selector.match_labels.is_empty());
        assert!(target.apm_versions.is_empty());
    }

    #[test]
    fn test_language_map_keys_parse() {
        let yaml = r#"
name: backend
language: python
apmVersions:
  python: "1.8.0"
  java: "2.2.1"
"#;
        let target: TargetSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            target.apm_versions.get(&Language::Python).map(String::as_str),
            Some("1.8.0")
        );
        assert_eq!(
            target.apm_versions.get(&Language::Java).map(String::as_str),
            Some("2.2.1")
        );
    }

    #[test]
    fn test_unknown_language_rejected() {
        let yaml = r#"
name: backend
language: cobol
"#;
        assert!(serde_yaml::from_str::<TargetSpec>(yaml).is_err());
    }

    #[test]
    fn test_selector_operator_wire_names() {
        let yaml = r#"
key: tier
operator: DoesNotExist
"#;
        let req: LabelSelectorRequirement = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(req.operator, SelectorOperator::DoesNotExist);
        assert!(req.values.is_empty());
    }

    #[test]
    fn test_instrumentation_disabled_when_omitted() {
        let spec: SightlineAgentSpec = serde_yaml::from_str("{}").unwrap();
        assert!(!spec.features.apm.instrumentation.enabled);
        assert!(spec.features.apm.instrumentation.targets.is_empty());
    }
}
