//! Open-agent scraper: Deployment plus its ServiceAccount, ClusterRole,
//! ClusterRoleBinding and scrape-config ConfigMap.
//!
//! The deployment update path retries on optimistic-concurrency conflicts
//! with bounded linear backoff before surfacing the error.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, ServiceAccount, Volume,
    VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::Api;
use tracing::debug;

use super::Context;
use crate::crd::{OpenAgentSpec, SightlineAgentSpec};
use crate::error::Result;
use crate::inject::{env, merge_env_list};

pub const OPEN_AGENT_NAME: &str = "sightline-open-agent";
pub const CONFIG_MAP_NAME: &str = "sightline-open-agent-config";
pub const SCRAPE_CONFIG_KEY: &str = "scrape_config.yaml";

const DEFAULT_IMAGE_REPO: &str = "ghcr.io/sightline-io/open-agent";
const CONFLICT_ATTEMPTS: u64 = 3;

pub(super) async fn reconcile(
    ctx: &Context,
    spec: &SightlineAgentSpec,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<()> {
    let open = &spec.features.open_agent;

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
    let service_accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), namespace);
    let cluster_roles: Api<ClusterRole> = Api::all(ctx.client.clone());
    let bindings: Api<ClusterRoleBinding> = Api::all(ctx.client.clone());

    if !open.enabled {
        super::delete_if_present(&deployments, OPEN_AGENT_NAME).await?;
        super::delete_if_present(&config_maps, CONFIG_MAP_NAME).await?;
        super::delete_if_present(&bindings, OPEN_AGENT_NAME).await?;
        super::delete_if_present(&cluster_roles, OPEN_AGENT_NAME).await?;
        super::delete_if_present(&service_accounts, OPEN_AGENT_NAME).await?;
        return Ok(());
    }

    super::create_or_update(&service_accounts, service_account(namespace, owner)).await?;
    super::create_or_update(&cluster_roles, cluster_role(owner)).await?;
    super::create_or_update(&bindings, cluster_role_binding(namespace, owner)).await?;
    super::create_or_update(&config_maps, scrape_config_map(spec, namespace, owner)?).await?;

    ensure_deployment(&deployments, open_agent_deployment(spec, namespace, owner)).await
}

/// Create-or-update with bounded conflict retry (3 attempts, 100ms per
/// attempt of linear backoff).
async fn ensure_deployment(api: &Api<Deployment>, desired: Deployment) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match super::create_or_update(api, desired.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() && attempt < CONFLICT_ATTEMPTS => {
                debug!(attempt, "open-agent deployment conflict, backing off");
                tokio::time::sleep(Duration::from_millis(100 * attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn service_account(namespace: &str, owner: &OwnerReference) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(OPEN_AGENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn cluster_role(owner: &OwnerReference) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(OPEN_AGENT_NAME.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec![
                    "pods".to_string(),
                    "services".to_string(),
                    "endpoints".to_string(),
                    "nodes".to_string(),
                    "namespaces".to_string(),
                ]),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            },
            PolicyRule {
                non_resource_urls: Some(vec!["/metrics".to_string()]),
                verbs: vec!["get".to_string()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn cluster_role_binding(namespace: &str, owner: &OwnerReference) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(OPEN_AGENT_NAME.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: OPEN_AGENT_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: OPEN_AGENT_NAME.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

fn scrape_config_map(
    spec: &SightlineAgentSpec,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIG_MAP_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            SCRAPE_CONFIG_KEY.to_string(),
            super::scrape::generate(spec)?,
        )])),
        ..Default::default()
    })
}

fn resolve_image(open: &OpenAgentSpec) -> String {
    if let Some(full) = open.custom_image_full_name.as_deref().filter(|s| !s.is_empty()) {
        return full.to_string();
    }
    let name = open
        .image_name
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_IMAGE_REPO);
    let version = open
        .image_version
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("latest");
    format!("{name}:{version}")
}

/// `-d` switches the agent to daemon mode; the default is foreground.
fn agent_args(open: &OpenAgentSpec) -> Option<Vec<String>> {
    if open.disable_foreground {
        Some(vec!["-d".to_string()])
    } else {
        None
    }
}

fn open_agent_deployment(
    spec: &SightlineAgentSpec,
    namespace: &str,
    owner: &OwnerReference,
) -> Deployment {
    let open = &spec.features.open_agent;
    let selector_labels = BTreeMap::from([("app".to_string(), OPEN_AGENT_NAME.to_string())]);

    let mut labels = open.labels.clone();
    labels.insert("app".to_string(), OPEN_AGENT_NAME.to_string());
    let mut pod_labels = open.pod_labels.clone();
    pod_labels.insert("app".to_string(), OPEN_AGENT_NAME.to_string());

    let mut container_env = vec![
        env("SIGHTLINE_LICENSE", &spec.license),
        env("SIGHTLINE_HOST", &spec.host),
        env("SIGHTLINE_PORT", &spec.port),
    ];
    merge_env_list(&mut container_env, open.envs.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(OPEN_AGENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: if open.annotations.is_empty() {
                None
            } else {
                Some(open.annotations.clone())
            },
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
                    labels: Some(pod_labels),
                    annotations: if open.pod_annotations.is_empty() {
                        None
                    } else {
                        Some(open.pod_annotations.clone())
                    },
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(OPEN_AGENT_NAME.to_string()),
                    node_selector: if open.node_selector.is_empty() {
                        None
                    } else {
                        Some(open.node_selector.clone())
                    },
                    affinity: open.affinity.clone(),
                    tolerations: if open.tolerations.is_empty() {
                        None
                    } else {
                        Some(open.tolerations.clone())
                    },
                    image_pull_secrets: if open.image_pull_secrets.is_empty() {
                        None
                    } else {
                        Some(open.image_pull_secrets.clone())
                    },
                    containers: vec![Container {
                        name: OPEN_AGENT_NAME.to_string(),
                        image: Some(resolve_image(open)),
                        args: agent_args(open),
                        env: Some(container_env),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "scrape-config".to_string(),
                            mount_path: "/open-agent/config".to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "scrape-config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: CONFIG_MAP_NAME.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_args_foreground_default() {
        assert_eq!(agent_args(&OpenAgentSpec::default()), None);
    }

    #[test]
    fn test_args_daemon_mode() {
        let open = OpenAgentSpec {
            disable_foreground: true,
            ..Default::default()
        };
        assert_eq!(agent_args(&open), Some(vec!["-d".to_string()]));
    }

    #[test]
    fn test_image_precedence() {
        let mut open = OpenAgentSpec::default();
        assert_eq!(resolve_image(&open), "ghcr.io/sightline-io/open-agent:latest");

        open.image_version = Some("0.9.1".to_string());
        assert_eq!(resolve_image(&open), "ghcr.io/sightline-io/open-agent:0.9.1");

        open.image_name = Some("registry.local/open-agent".to_string());
        assert_eq!(resolve_image(&open), "registry.local/open-agent:0.9.1");

        open.custom_image_full_name = Some("registry.local/pinned:v3".to_string());
        assert_eq!(resolve_image(&open), "registry.local/pinned:v3");
    }

    #[test]
    fn test_binding_points_at_service_account() {
        let binding = cluster_role_binding("sightline-monitoring", &owner());
        assert_eq!(binding.role_ref.name, OPEN_AGENT_NAME);
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.namespace.as_deref(), Some("sightline-monitoring"));
    }

    #[test]
    fn test_deployment_mounts_scrape_config() {
        let spec = SightlineAgentSpec {
            features: crate::crd::FeaturesSpec {
                open_agent: OpenAgentSpec {
                    enabled: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let deploy = open_agent_deployment(&spec, "ns", &owner());
        let pod_spec = deploy.spec.unwrap().template.spec.unwrap();
        let volume = &pod_spec.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.config_map.as_ref().unwrap().name,
            CONFIG_MAP_NAME
        );
        let mount = &pod_spec.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.name, "scrape-config");
    }
}
