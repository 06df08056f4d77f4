//! APM injection planning.
//!
//! Given a matched instrumentation target, produce an [`InjectionPlan`]
//! (init containers + shared volume) and apply it to a pod spec: stage the
//! agent through the sentinel init container, synthesize the agent config
//! where the language needs one, and merge env vars into every application
//! container without overriding anything the container already declares.
//!
//! Plans are ephemeral: recomputed on every admission call, never stored.

mod java;
mod nodejs;
mod python;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ObjectFieldSelector, PodSpec, SecurityContext, Volume, VolumeMount,
};

use crate::crd::{
    ConfigMode, InstrumentationSpec, Language, SightlineAgentSpec, TargetSpec,
};
use crate::error::{Result, SightlineError};

/// Sentinel init container; its presence marks a pod as already injected.
pub const INIT_CONTAINER_NAME: &str = "sightline-agent-init";
/// Init container that writes the agent config file.
pub const CONFIG_INIT_CONTAINER_NAME: &str = "sightline-config-init";
pub const AGENT_VOLUME_NAME: &str = "sightline-agent-volume";
pub const AGENT_MOUNT_PATH: &str = "/sightline-agent";
pub const CONFIG_VOLUME_NAME: &str = "sightline-config-volume";
pub const CONFIG_MOUNT_PATH: &str = "/sightline-config";
pub const AGENT_CONF_PATH: &str = "/sightline-agent/sightline.conf";

const DEFAULT_INIT_IMAGE_REPO: &str = "ghcr.io/sightline-io/apm-init";
const CONFIG_INIT_IMAGE: &str = "alpine:3.18";

pub const ANNOTATION_INJECTED: &str = "sightline-apm-injected";
pub const ANNOTATION_LANGUAGE: &str = "sightline-apm-language";
pub const ANNOTATION_VERSION: &str = "sightline-apm-version";

/// Ordered mutation recipe for one pod/target pair.
#[derive(Debug, Clone)]
pub struct InjectionPlan {
    pub language: Language,
    pub version: String,
    pub init_containers: Vec<Container>,
    pub volumes: Vec<Volume>,
}

/// Computes the injection plan for a matched target. Fails without side
/// effects when the target has no version for its language.
pub fn plan(
    spec: &SightlineAgentSpec,
    instrumentation: &InstrumentationSpec,
    target: &TargetSpec,
) -> Result<InjectionPlan> {
    let version = target
        .apm_versions
        .get(&target.language)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or(SightlineError::MissingApmVersion {
            language: target.language,
        })?;

    let mut init_containers = vec![Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(resolve_init_image(target, &version)),
        volume_mounts: Some(vec![agent_volume_mount()]),
        security_context: init_security_context(instrumentation, target),
        ..Default::default()
    }];

    let mut volumes = vec![Volume {
        name: AGENT_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];

    match (&target.config.mode, &target.config.config_map_ref) {
        (ConfigMode::Custom, Some(reference)) => {
            init_containers.push(config_init_container(
                append_conf_script(&agent_conf_lines(spec, target)),
                true,
            ));
            volumes.push(Volume {
                name: CONFIG_VOLUME_NAME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: reference.name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        _ if target.language == Language::Java => {
            init_containers.push(config_init_container(
                synthesize_conf_script(&agent_conf_lines(spec, target)),
                false,
            ));
        }
        _ => {}
    }

    Ok(InjectionPlan {
        language: target.language,
        version,
        init_containers,
        volumes,
    })
}

/// Applies a plan to a pod spec: appends init containers, ensures each
/// shared volume exists exactly once and rewrites every application
/// container for the plan's language.
pub fn apply_plan(
    plan: &InjectionPlan,
    spec: &SightlineAgentSpec,
    target: &TargetSpec,
    pod_spec: &mut PodSpec,
) {
    pod_spec
        .init_containers
        .get_or_insert_with(Vec::new)
        .extend(plan.init_containers.iter().cloned());

    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    for volume in &plan.volumes {
        if !volumes.iter().any(|v| v.name == volume.name) {
            volumes.push(volume.clone());
        }
    }

    for container in pod_spec.containers.iter_mut() {
        match plan.language {
            Language::Java => java::inject(container, spec),
            Language::Python => python::inject(container, spec, target),
            Language::Nodejs => nodejs::inject(container, spec),
            Language::Php | Language::Dotnet | Language::Golang => {
                merge_env_vars(container, identity_env_vars());
            }
        }

        if !target.envs.is_empty() {
            merge_env_vars(container, target.envs.clone());
        }

        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        if !mounts.iter().any(|m| m.name == AGENT_VOLUME_NAME) {
            mounts.push(agent_volume_mount());
        }
    }
}

/// True when the pod spec already carries the sentinel init container.
pub fn is_already_injected(pod_spec: &PodSpec) -> bool {
    pod_spec
        .init_containers
        .iter()
        .flatten()
        .any(|c| c.name == INIT_CONTAINER_NAME)
}

/// Resolves the init image: explicit full name, then name + language
/// version, then the built-in default repository.
pub fn resolve_init_image(target: &TargetSpec, version: &str) -> String {
    if let Some(full) = target
        .custom_image_full_name
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        return full.to_string();
    }
    if let Some(name) = target.custom_image_name.as_deref().filter(|s| !s.is_empty()) {
        return format!("{name}:{version}");
    }
    format!("{}-{}:{}", DEFAULT_INIT_IMAGE_REPO, target.language, version)
}

/// The `key=value` lines of the generated agent config: connection
/// settings plus every additional-args entry exactly once.
pub fn agent_conf_lines(spec: &SightlineAgentSpec, target: &TargetSpec) -> Vec<String> {
    let mut lines = vec![
        format!("license={}", spec.license),
        format!("sightline.server.host={}", spec.host),
        format!("sightline.server.port={}", spec.port),
        "sightline.micro.enabled=true".to_string(),
    ];
    for (key, value) in &target.additional_args {
        lines.push(format!("{key}={value}"));
    }
    lines
}

fn synthesize_conf_script(lines: &[String]) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let redirect = if i == 0 { ">" } else { ">>" };
            format!("echo \"{line}\" {redirect} {AGENT_CONF_PATH}")
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

fn append_conf_script(lines: &[String]) -> String {
    let mut parts = vec![format!(
        "cp {CONFIG_MOUNT_PATH}/sightline.conf {AGENT_MOUNT_PATH}/"
    )];
    parts.extend(
        lines
            .iter()
            .map(|line| format!("echo \"{line}\" >> {AGENT_CONF_PATH}")),
    );
    parts.join(" && ")
}

fn config_init_container(script: String, mount_config_volume: bool) -> Container {
    let mut mounts = vec![agent_volume_mount()];
    if mount_config_volume {
        mounts.push(VolumeMount {
            name: CONFIG_VOLUME_NAME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }
    Container {
        name: CONFIG_INIT_CONTAINER_NAME.to_string(),
        image: Some(CONFIG_INIT_IMAGE.to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![script]),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

fn init_security_context(
    instrumentation: &InstrumentationSpec,
    target: &TargetSpec,
) -> Option<SecurityContext> {
    let security = target
        .init_container_security
        .as_ref()
        .or(instrumentation.init_container_security.as_ref())?;
    Some(SecurityContext {
        run_as_non_root: security.run_as_non_root,
        run_as_user: security.run_as_user,
        ..Default::default()
    })
}

pub(crate) fn agent_volume_mount() -> VolumeMount {
    VolumeMount {
        name: AGENT_VOLUME_NAME.to_string(),
        mount_path: AGENT_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

pub(crate) fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

pub(crate) fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

/// Node/pod identity env vars injected for every language.
pub(crate) fn identity_env_vars() -> Vec<EnvVar> {
    vec![
        field_ref_env("NODE_IP", "status.hostIP"),
        field_ref_env("NODE_NAME", "spec.nodeName"),
        field_ref_env("POD_NAME", "metadata.name"),
    ]
}

/// Appends `extras` to the container's env, skipping any name the
/// container already declares.
pub(crate) fn merge_env_vars(container: &mut Container, extras: Vec<EnvVar>) {
    merge_env_list(container.env.get_or_insert_with(Vec::new), extras);
}

/// List-level env merge with the same keep-existing rule.
pub(crate) fn merge_env_list(envs: &mut Vec<EnvVar>, extras: Vec<EnvVar>) {
    for extra in extras {
        if extra.name.is_empty() {
            continue;
        }
        if envs.iter().any(|e| e.name == extra.name) {
            continue;
        }
        envs.push(extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConfigMapRef, ConfigSpec, InitContainerSecuritySpec};
    use std::collections::BTreeMap;

    fn record() -> SightlineAgentSpec {
        SightlineAgentSpec {
            license: "lic-123".to_string(),
            host: "collect.sightline.io".to_string(),
            port: "6600".to_string(),
            ..Default::default()
        }
    }

    fn target(language: Language) -> TargetSpec {
        TargetSpec {
            name: "backend".to_string(),
            enabled: true,
            language,
            apm_versions: BTreeMap::from([(language, "1.2.3".to_string())]),
            custom_image_full_name: None,
            custom_image_name: None,
            additional_args: BTreeMap::new(),
            envs: Vec::new(),
            namespace_selector: Default::default(),
            pod_selector: Default::default(),
            config: Default::default(),
            init_container_security: None,
            image_pull_secrets: Vec::new(),
        }
    }

    fn pod_spec_with(containers: Vec<Container>) -> PodSpec {
        PodSpec {
            containers,
            ..Default::default()
        }
    }

    fn app_container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_fails_without_version() {
        let mut target = target(Language::Java);
        target.apm_versions.clear();
        let err = plan(&record(), &Default::default(), &target).unwrap_err();
        assert!(err.to_string().contains("java"));
    }

    #[test]
    fn test_image_precedence_default() {
        let target = target(Language::Java);
        assert_eq!(
            resolve_init_image(&target, "1.2.3"),
            "ghcr.io/sightline-io/apm-init-java:1.2.3"
        );
    }

    #[test]
    fn test_image_precedence_name_version() {
        let mut target = target(Language::Java);
        target.custom_image_name = Some("registry.local/apm-java".to_string());
        assert_eq!(
            resolve_init_image(&target, "1.2.3"),
            "registry.local/apm-java:1.2.3"
        );
    }

    #[test]
    fn test_image_precedence_full_name_wins() {
        let mut target = target(Language::Java);
        target.custom_image_name = Some("registry.local/apm-java".to_string());
        target.custom_image_full_name = Some("registry.local/pinned:v9".to_string());
        assert_eq!(resolve_init_image(&target, "1.2.3"), "registry.local/pinned:v9");
    }

    #[test]
    fn test_conf_lines_include_each_additional_arg_once() {
        let mut target = target(Language::Java);
        target.additional_args = BTreeMap::from([
            ("profile.enabled".to_string(), "true".to_string()),
            ("sampling.rate".to_string(), "0.5".to_string()),
            ("zone".to_string(), "eu-1".to_string()),
        ]);
        let lines = agent_conf_lines(&record(), &target);
        assert_eq!(lines.len(), 4 + 3);
        for needle in [
            "license=lic-123",
            "sightline.server.host=collect.sightline.io",
            "sightline.server.port=6600",
            "sightline.micro.enabled=true",
            "profile.enabled=true",
            "sampling.rate=0.5",
            "zone=eu-1",
        ] {
            assert_eq!(
                lines.iter().filter(|l| l.as_str() == needle).count(),
                1,
                "expected exactly one line {needle}"
            );
        }
    }

    #[test]
    fn test_java_plan_has_config_init() {
        let plan = plan(&record(), &Default::default(), &target(Language::Java)).unwrap();
        assert_eq!(plan.init_containers.len(), 2);
        assert_eq!(plan.init_containers[0].name, INIT_CONTAINER_NAME);
        assert_eq!(plan.init_containers[1].name, CONFIG_INIT_CONTAINER_NAME);
        assert_eq!(plan.volumes.len(), 1);
    }

    #[test]
    fn test_python_default_plan_has_no_config_init() {
        let plan = plan(&record(), &Default::default(), &target(Language::Python)).unwrap();
        assert_eq!(plan.init_containers.len(), 1);
    }

    #[test]
    fn test_custom_config_adds_config_volume() {
        let mut target = target(Language::Python);
        target.config = ConfigSpec {
            mode: ConfigMode::Custom,
            config_map_ref: Some(ConfigMapRef {
                name: "custom-conf".to_string(),
                namespace: None,
            }),
        };
        let plan = plan(&record(), &Default::default(), &target).unwrap();
        assert_eq!(plan.init_containers.len(), 2);
        assert_eq!(plan.volumes.len(), 2);
        let script = plan.init_containers[1].args.as_ref().unwrap()[0].clone();
        assert!(script.starts_with("cp /sightline-config/sightline.conf"));
    }

    #[test]
    fn test_target_security_overrides_instrumentation() {
        let instrumentation = InstrumentationSpec {
            init_container_security: Some(InitContainerSecuritySpec {
                run_as_non_root: Some(true),
                run_as_user: Some(1001),
            }),
            ..Default::default()
        };
        let mut target = target(Language::Java);
        target.init_container_security = Some(InitContainerSecuritySpec {
            run_as_non_root: Some(false),
            run_as_user: Some(0),
        });
        let plan = plan(&record(), &instrumentation, &target).unwrap();
        let sc = plan.init_containers[0].security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_user, Some(0));
    }

    #[test]
    fn test_apply_merges_without_override() {
        let mut spec = pod_spec_with(vec![Container {
            name: "app".to_string(),
            env: Some(vec![env("license", "user-owned")]),
            ..Default::default()
        }]);
        let target = target(Language::Java);
        let plan = plan(&record(), &Default::default(), &target).unwrap();
        apply_plan(&plan, &record(), &target, &mut spec);

        let envs = spec.containers[0].env.as_ref().unwrap();
        let license: Vec<_> = envs.iter().filter(|e| e.name == "license").collect();
        assert_eq!(license.len(), 1);
        assert_eq!(license[0].value.as_deref(), Some("user-owned"));
    }

    #[test]
    fn test_apply_adds_shared_volume_exactly_once() {
        let mut spec = pod_spec_with(vec![app_container("app")]);
        spec.volumes = Some(vec![Volume {
            name: AGENT_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }]);
        let target = target(Language::Nodejs);
        let plan = plan(&record(), &Default::default(), &target).unwrap();
        apply_plan(&plan, &record(), &target, &mut spec);

        let count = spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .filter(|v| v.name == AGENT_VOLUME_NAME)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_baseline_language_gets_identity_env_only() {
        let mut spec = pod_spec_with(vec![app_container("app")]);
        let target = target(Language::Golang);
        let plan = plan(&record(), &Default::default(), &target).unwrap();
        apply_plan(&plan, &record(), &target, &mut spec);

        let envs = spec.containers[0].env.as_ref().unwrap();
        let names: Vec<_> = envs.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["NODE_IP", "NODE_NAME", "POD_NAME"]);
    }

    #[test]
    fn test_sentinel_marks_injected() {
        let mut spec = pod_spec_with(vec![app_container("app")]);
        assert!(!is_already_injected(&spec));
        let target = target(Language::Java);
        let plan = plan(&record(), &Default::default(), &target).unwrap();
        apply_plan(&plan, &record(), &target, &mut spec);
        assert!(is_already_injected(&spec));
    }

    #[test]
    fn test_every_container_gets_agent_mount() {
        let mut spec = pod_spec_with(vec![app_container("app"), app_container("sidecar")]);
        let target = target(Language::Java);
        let plan = plan(&record(), &Default::default(), &target).unwrap();
        apply_plan(&plan, &record(), &target, &mut spec);

        for container in &spec.containers {
            let mounts = container.volume_mounts.as_ref().unwrap();
            assert_eq!(
                mounts
                    .iter()
                    .filter(|m| m.name == AGENT_VOLUME_NAME)
                    .count(),
                1
            );
        }
    }
}
