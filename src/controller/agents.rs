//! Managed agent workloads: master agent Deployment, node agent DaemonSet
//! (with optional GPU exporter sidecar), the GPU exporter Service and the
//! control-plane monitor stubs.
//!
//! Each builder renders the full desired object from the record; the
//! generic create-or-update in the parent module handles convergence.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, HostPathVolumeSource, PodSpec, PodTemplateSpec, ResourceFieldSelector,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;

use super::Context;
use crate::crd::{GpuMonitoringSpec, K8sAgentSpec, SightlineAgentSpec};
use crate::error::Result;
use crate::inject::{env, field_ref_env, merge_env_list};

pub const MASTER_AGENT_NAME: &str = "sightline-master-agent";
pub const NODE_AGENT_NAME: &str = "sightline-node-agent";
pub const NODE_HELPER_NAME: &str = "sightline-node-helper";
pub const GPU_SERVICE_NAME: &str = "sightline-dcgm-exporter";
pub const GPU_EXPORTER_CONTAINER: &str = "dcgm-exporter";

/// Pod label marking node-agent pods that carry the GPU exporter sidecar.
pub const GPU_POD_LABEL_KEY: &str = "sightline-gpu";

pub const MONITOR_STUB_NAMES: [&str; 3] = [
    "sightline-apiserver-monitor",
    "sightline-etcd-monitor",
    "sightline-scheduler-monitor",
];

const SERVICE_ACCOUNT_NAME: &str = "sightline";
const DEFAULT_AGENT_IMAGE_REPO: &str = "ghcr.io/sightline-io/kube-agent";
const DEFAULT_DCGM_IMAGE: &str = "nvcr.io/nvidia/k8s/dcgm-exporter:3.3.5-3.4.0-ubuntu22.04";
const HELPER_PORT: i32 = 6801;
const AGENT_PORT: i32 = 6600;

pub(super) async fn reconcile_master_agent(
    ctx: &Context,
    spec: &SightlineAgentSpec,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    if spec.features.k8s_agent.master_agent.enabled {
        super::create_or_update(&api, master_agent_deployment(spec, namespace, owner)).await
    } else {
        super::delete_if_present(&api, MASTER_AGENT_NAME).await
    }
}

pub(super) async fn reconcile_node_agent(
    ctx: &Context,
    spec: &SightlineAgentSpec,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<()> {
    let api: Api<DaemonSet> = Api::namespaced(ctx.client.clone(), namespace);
    if spec.features.k8s_agent.node_agent.enabled {
        super::create_or_update(&api, node_agent_daemon_set(spec, namespace, owner)).await
    } else {
        super::delete_if_present(&api, NODE_AGENT_NAME).await
    }
}

pub(super) async fn reconcile_gpu_service(
    ctx: &Context,
    spec: &SightlineAgentSpec,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<()> {
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let gpu = &spec.features.k8s_agent.gpu_monitoring;
    let wanted = gpu.enabled && gpu.service.as_ref().map(|s| s.enabled).unwrap_or(false);
    if wanted {
        super::create_or_update(&api, gpu_exporter_service(gpu, namespace, owner)).await
    } else {
        super::delete_if_present(&api, GPU_SERVICE_NAME).await
    }
}

pub(super) async fn reconcile_monitor_stubs(
    ctx: &Context,
    spec: &SightlineAgentSpec,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
    let k8s = &spec.features.k8s_agent;
    let stubs = [
        (MONITOR_STUB_NAMES[0], "apiserver", &k8s.apiserver_monitoring),
        (MONITOR_STUB_NAMES[1], "etcd", &k8s.etcd_monitoring),
        (MONITOR_STUB_NAMES[2], "scheduler", &k8s.scheduler_monitoring),
    ];
    for (name, component, stub) in stubs {
        if stub.enabled {
            let image = stub
                .custom_image_full_name
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| resolve_agent_image(k8s));
            let config_map = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    owner_references: Some(vec![owner.clone()]),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([
                    ("component".to_string(), component.to_string()),
                    ("image".to_string(), image),
                ])),
                ..Default::default()
            };
            super::create_or_update(&api, config_map).await?;
        } else {
            super::delete_if_present(&api, name).await?;
        }
    }
    Ok(())
}

/// Agent image precedence: full override, then name/version pair, then the
/// built-in default.
pub fn resolve_agent_image(k8s: &K8sAgentSpec) -> String {
    if let Some(full) = k8s.custom_image_full_name.as_deref().filter(|s| !s.is_empty()) {
        return full.to_string();
    }
    let name = k8s
        .agent_image_name
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_AGENT_IMAGE_REPO);
    let version = k8s
        .agent_image_version
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("latest");
    format!("{name}:{version}")
}

/// Fills only the limit/request keys the record leaves absent.
pub fn resources_with_defaults(
    base: Option<&ResourceRequirements>,
    default_limits: &[(&str, &str)],
    default_requests: &[(&str, &str)],
) -> ResourceRequirements {
    let mut resources = base.cloned().unwrap_or_default();
    let limits = resources.limits.get_or_insert_with(BTreeMap::new);
    for (key, value) in default_limits {
        limits
            .entry(key.to_string())
            .or_insert_with(|| Quantity(value.to_string()));
    }
    let requests = resources.requests.get_or_insert_with(BTreeMap::new);
    for (key, value) in default_requests {
        requests
            .entry(key.to_string())
            .or_insert_with(|| Quantity(value.to_string()));
    }
    resources
}

/// User-provided labels merged under the operator's identifying labels;
/// the identifying keys always win.
fn with_base_labels(
    extra: &BTreeMap<String, String>,
    base: &[(&str, &str)],
) -> BTreeMap<String, String> {
    let mut labels = extra.clone();
    for (key, value) in base {
        labels.insert(key.to_string(), value.to_string());
    }
    labels
}

fn option_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}

fn option_vec<T: Clone>(items: &[T]) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items.to_vec())
    }
}

fn memory_limit_env(container_name: &str) -> EnvVar {
    EnvVar {
        name: "SIGHTLINE_MEM_LIMIT".to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            resource_field_ref: Some(ResourceFieldSelector {
                container_name: Some(container_name.to_string()),
                resource: "limits.memory".to_string(),
                divisor: None,
            }),
            ..Default::default()
        }),
    }
}

fn connection_env(spec: &SightlineAgentSpec) -> Vec<EnvVar> {
    vec![
        env("SIGHTLINE_LICENSE", &spec.license),
        env("SIGHTLINE_HOST", &spec.host),
        env("SIGHTLINE_PORT", &spec.port),
    ]
}

fn start_script_volume(config_map_name: &str) -> Volume {
    Volume {
        name: "start-script-volume".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name.to_string(),
            // 0700: the entrypoint is executed directly.
            default_mode: Some(0o700),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: None,
        }),
        ..Default::default()
    }
}

fn master_agent_deployment(
    spec: &SightlineAgentSpec,
    namespace: &str,
    owner: &OwnerReference,
) -> Deployment {
    let k8s = &spec.features.k8s_agent;
    let master = &k8s.master_agent;
    let image = resolve_agent_image(k8s);
    let selector_labels = BTreeMap::from([("name".to_string(), MASTER_AGENT_NAME.to_string())]);

    let mut container_env = connection_env(spec);
    container_env.push(memory_limit_env(MASTER_AGENT_NAME));
    merge_env_list(&mut container_env, master.envs.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(MASTER_AGENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(with_base_labels(&master.labels, &[("name", MASTER_AGENT_NAME)])),
            annotations: option_map(&master.annotations),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(with_base_labels(
                        &master.pod_labels,
                        &[("name", MASTER_AGENT_NAME)],
                    )),
                    annotations: option_map(&master.pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
                    node_selector: option_map(&master.node_selector),
                    affinity: master.affinity.clone(),
                    tolerations: option_vec(&master.tolerations),
                    image_pull_secrets: option_vec(&k8s.image_pull_secrets),
                    containers: vec![Container {
                        name: MASTER_AGENT_NAME.to_string(),
                        image: Some(image),
                        command: Some(vec!["/bin/entrypoint.sh".to_string()]),
                        ports: Some(vec![ContainerPort {
                            container_port: AGENT_PORT,
                            ..Default::default()
                        }]),
                        env: Some(container_env),
                        resources: Some(resources_with_defaults(
                            master.resources.as_ref(),
                            &[("cpu", "200m"), ("memory", "350Mi")],
                            &[("cpu", "100m"), ("memory", "300Mi")],
                        )),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "start-script-volume".to_string(),
                                mount_path: "/bin/entrypoint.sh".to_string(),
                                sub_path: Some("entrypoint.sh".to_string()),
                                read_only: Some(true),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "sightline-config-volume".to_string(),
                                mount_path: "/sightline_conf".to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        start_script_volume("sightline-master-start-script"),
                        Volume {
                            name: "sightline-config-volume".to_string(),
                            empty_dir: Some(EmptyDirVolumeSource::default()),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn node_agent_daemon_set(
    spec: &SightlineAgentSpec,
    namespace: &str,
    owner: &OwnerReference,
) -> DaemonSet {
    let k8s = &spec.features.k8s_agent;
    let node = &k8s.node_agent;
    let gpu = &k8s.gpu_monitoring;
    let image = resolve_agent_image(k8s);
    let selector_labels = BTreeMap::from([("name".to_string(), NODE_AGENT_NAME.to_string())]);

    let mut pod_labels = with_base_labels(&node.pod_labels, &[("name", NODE_AGENT_NAME)]);
    if gpu.enabled {
        pod_labels.insert(GPU_POD_LABEL_KEY.to_string(), "true".to_string());
    }

    let runtime_socket = node
        .runtime_socket_path
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| node.runtime.socket_path().to_string());

    let helper_container = Container {
        name: NODE_HELPER_NAME.to_string(),
        image: Some(image.clone()),
        command: Some(vec![
            "/data/agent/node/cadvisor_helper".to_string(),
            "-port".to_string(),
            HELPER_PORT.to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("helperport".to_string()),
            container_port: HELPER_PORT,
            ..Default::default()
        }]),
        env: Some(vec![field_ref_env("NODE_NAME", "spec.nodeName")]),
        resources: Some(resources_with_defaults(
            None,
            &[("cpu", "200m"), ("memory", "350Mi")],
            &[("cpu", "100m"), ("memory", "100Mi")],
        )),
        volume_mounts: Some(vec![
            read_only_mount("rootfs", "/rootfs"),
            read_only_mount("hostsys", "/sys"),
            read_only_mount("hostdiskdevice", "/dev/disk"),
            VolumeMount {
                name: "runtime-socket".to_string(),
                mount_path: runtime_socket.clone(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let mut agent_env = vec![
        field_ref_env("NODE_IP", "status.hostIP"),
        field_ref_env("NODE_NAME", "spec.nodeName"),
    ];
    agent_env.extend(connection_env(spec));
    agent_env.push(memory_limit_env(NODE_AGENT_NAME));
    agent_env.push(env("HOST_PREFIX", "/rootfs"));
    merge_env_list(&mut agent_env, node.envs.clone());

    let agent_container = Container {
        name: NODE_AGENT_NAME.to_string(),
        image: Some(image.clone()),
        command: Some(vec!["/bin/entrypoint.sh".to_string()]),
        ports: Some(vec![ContainerPort {
            name: Some("nodeport".to_string()),
            container_port: AGENT_PORT,
            ..Default::default()
        }]),
        env: Some(agent_env),
        resources: Some(resources_with_defaults(
            node.resources.as_ref(),
            &[("cpu", "200m"), ("memory", "350Mi")],
            &[("cpu", "100m"), ("memory", "300Mi")],
        )),
        volume_mounts: Some(vec![
            read_only_mount("rootfs", "/rootfs"),
            VolumeMount {
                name: "start-script-volume".to_string(),
                mount_path: "/bin/entrypoint.sh".to_string(),
                sub_path: Some("entrypoint.sh".to_string()),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "sightline-config-volume".to_string(),
                mount_path: "/sightline_conf".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let mut containers = vec![helper_container, agent_container];
    if gpu.enabled {
        containers.push(gpu_exporter_container(gpu));
    }

    let mut tolerations = vec![
        Toleration {
            key: Some("node-role.kubernetes.io/master".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        },
        Toleration {
            key: Some("node-role.kubernetes.io/control-plane".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        },
    ];
    tolerations.extend(node.tolerations.iter().cloned());

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(NODE_AGENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(with_base_labels(&node.labels, &[("name", NODE_AGENT_NAME)])),
            annotations: option_map(&node.annotations),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: option_map(&node.pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
                    node_selector: option_map(&node.node_selector),
                    affinity: node.affinity.clone(),
                    tolerations: Some(tolerations),
                    image_pull_secrets: option_vec(&k8s.image_pull_secrets),
                    init_containers: Some(vec![Container {
                        name: "sightline-node-debug".to_string(),
                        image: Some(image),
                        command: Some(vec![
                            "/data/agent/tools/sightline_debugger".to_string(),
                            "run".to_string(),
                        ]),
                        volume_mounts: Some(vec![read_only_mount("rootfs", "/rootfs")]),
                        ..Default::default()
                    }]),
                    containers,
                    volumes: Some(vec![
                        host_path_volume("rootfs", "/"),
                        host_path_volume("hostsys", "/sys"),
                        host_path_volume("hostdiskdevice", "/dev/disk"),
                        host_path_volume("runtime-socket", &runtime_socket),
                        start_script_volume("sightline-node-start-script"),
                        Volume {
                            name: "sightline-config-volume".to_string(),
                            empty_dir: Some(EmptyDirVolumeSource::default()),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn gpu_exporter_container(gpu: &GpuMonitoringSpec) -> Container {
    let image = gpu
        .custom_image_full_name
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_DCGM_IMAGE.to_string());
    Container {
        name: GPU_EXPORTER_CONTAINER.to_string(),
        image: Some(image),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: 9400,
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn gpu_exporter_service(
    gpu: &GpuMonitoringSpec,
    namespace: &str,
    owner: &OwnerReference,
) -> Service {
    let service = gpu.service.as_ref();
    let port = service.map(|s| s.port).unwrap_or(9400);
    Service {
        metadata: ObjectMeta {
            name: Some(GPU_SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "name".to_string(),
                GPU_SERVICE_NAME.to_string(),
            )])),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "name".to_string(),
                NODE_AGENT_NAME.to_string(),
            )])),
            type_: service.and_then(|s| s.type_.clone()),
            ports: Some(vec![ServicePort {
                name: Some("metrics".to_string()),
                port,
                target_port: Some(IntOrString::Int(9400)),
                node_port: service.and_then(|s| s.node_port),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GpuServiceSpec, MasterAgentSpec, NodeAgentSpec};

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "monitoring.sightline.io/v1alpha1".to_string(),
            kind: "SightlineAgent".to_string(),
            name: "sightline".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            ..Default::default()
        }
    }

    fn spec() -> SightlineAgentSpec {
        SightlineAgentSpec {
            license: "lic".to_string(),
            host: "host".to_string(),
            port: "6600".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_agent_image_precedence() {
        let mut k8s = K8sAgentSpec::default();
        assert_eq!(
            resolve_agent_image(&k8s),
            "ghcr.io/sightline-io/kube-agent:latest"
        );

        k8s.agent_image_version = Some("1.9.2".to_string());
        assert_eq!(
            resolve_agent_image(&k8s),
            "ghcr.io/sightline-io/kube-agent:1.9.2"
        );

        k8s.agent_image_name = Some("registry.local/kube-agent".to_string());
        assert_eq!(resolve_agent_image(&k8s), "registry.local/kube-agent:1.9.2");

        k8s.custom_image_full_name = Some("registry.local/pinned:v7".to_string());
        assert_eq!(resolve_agent_image(&k8s), "registry.local/pinned:v7");
    }

    #[test]
    fn test_resource_defaulting_fills_only_absent_keys() {
        let base = ResourceRequirements {
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity("1Gi".to_string()),
            )])),
            ..Default::default()
        };
        let resources = resources_with_defaults(
            Some(&base),
            &[("cpu", "200m"), ("memory", "350Mi")],
            &[("cpu", "100m")],
        );
        let limits = resources.limits.unwrap();
        assert_eq!(limits["memory"], Quantity("1Gi".to_string()));
        assert_eq!(limits["cpu"], Quantity("200m".to_string()));
        let requests = resources.requests.unwrap();
        assert_eq!(requests["cpu"], Quantity("100m".to_string()));
    }

    #[test]
    fn test_gpu_label_only_when_enabled() {
        let mut spec = spec();
        spec.features.k8s_agent.node_agent = NodeAgentSpec {
            enabled: true,
            ..Default::default()
        };

        let ds = node_agent_daemon_set(&spec, "ns", &owner());
        let labels = ds
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .clone()
            .unwrap();
        assert!(!labels.contains_key(GPU_POD_LABEL_KEY));

        spec.features.k8s_agent.gpu_monitoring.enabled = true;
        let ds = node_agent_daemon_set(&spec, "ns", &owner());
        let labels = ds
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .clone()
            .unwrap();
        assert_eq!(labels.get(GPU_POD_LABEL_KEY).map(String::as_str), Some("true"));
    }

    #[test]
    fn test_gpu_sidecar_added_when_enabled() {
        let mut spec = spec();
        spec.features.k8s_agent.node_agent.enabled = true;
        spec.features.k8s_agent.gpu_monitoring.enabled = true;

        let ds = node_agent_daemon_set(&spec, "ns", &owner());
        let containers = &ds
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers;
        assert!(containers.iter().any(|c| c.name == GPU_EXPORTER_CONTAINER));
    }

    #[test]
    fn test_master_env_connection_values_not_duplicated() {
        let mut spec = spec();
        spec.features.k8s_agent.master_agent = MasterAgentSpec {
            enabled: true,
            envs: vec![env("SIGHTLINE_HOST", "user-override")],
            ..Default::default()
        };
        let deploy = master_agent_deployment(&spec, "ns", &owner());
        let envs = deploy.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        let hosts: Vec<_> = envs.iter().filter(|e| e.name == "SIGHTLINE_HOST").collect();
        assert_eq!(hosts.len(), 1);
        // The operator-rendered connection value wins; user extras only
        // fill names the operator does not set.
        assert_eq!(hosts[0].value.as_deref(), Some("host"));
    }

    #[test]
    fn test_node_agent_carries_control_plane_tolerations() {
        let mut spec = spec();
        spec.features.k8s_agent.node_agent.enabled = true;
        let ds = node_agent_daemon_set(&spec, "ns", &owner());
        let tolerations = ds
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .tolerations
            .unwrap();
        assert!(tolerations
            .iter()
            .any(|t| t.key.as_deref() == Some("node-role.kubernetes.io/control-plane")));
    }

    #[test]
    fn test_gpu_service_ports() {
        let gpu = GpuMonitoringSpec {
            enabled: true,
            service: Some(GpuServiceSpec {
                enabled: true,
                type_: Some("NodePort".to_string()),
                node_port: Some(30400),
                port: 9400,
            }),
            ..Default::default()
        };
        let service = gpu_exporter_service(&gpu, "ns", &owner());
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 9400);
        assert_eq!(port.node_port, Some(30400));
    }

    #[test]
    fn test_owner_reference_present_on_workloads() {
        let mut spec = spec();
        spec.features.k8s_agent.master_agent.enabled = true;
        let deploy = master_agent_deployment(&spec, "ns", &owner());
        let owners = deploy.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "SightlineAgent");
    }
}
