//! Python injection: the agent loads through a `PYTHONPATH` bootstrap
//! package, so the bootstrap directory is prepended to keep it ahead of
//! application paths, and an explicitly declared command is rewritten to
//! run through the launcher with the original command preserved as
//! arguments.

use k8s_openapi::api::core::v1::{Container, EnvVar};
use tracing::{debug, warn};

use super::{env, identity_env_vars, merge_env_vars, AGENT_MOUNT_PATH};
use crate::crd::{SightlineAgentSpec, TargetSpec};

const ENV_LICENSE: &str = "license";
const ENV_SERVER_HOST: &str = "sightline_server_host";
const ENV_SERVER_PORT: &str = "sightline_server_port";
const ENV_APP_NAME: &str = "app_name";
const ENV_APP_PROCESS_NAME: &str = "app_process_name";
const ENV_MICRO_ENABLED: &str = "sightline.micro.enabled";
const ENV_HOME: &str = "SIGHTLINE_HOME";
const ENV_AGENT_PATH: &str = "SIGHTLINE_PYTHON_AGENT_PATH";
const ENV_PYTHONPATH: &str = "PYTHONPATH";
const AGENT_PATH: &str = "/sightline-agent/sightline_python";
const BOOTSTRAP_PATH: &str = "/sightline-agent/sightline/bootstrap";
const LAUNCHER_PATH: &str = "/sightline-agent/bin/sightline-start-agent";

pub(super) fn inject(container: &mut Container, spec: &SightlineAgentSpec, target: &TargetSpec) {
    // Application identity comes from the target's extra envs, falling
    // back to the container name.
    let app_name = target_env(target, ENV_APP_NAME).unwrap_or_else(|| container.name.clone());
    let app_process_name = target_env(target, ENV_APP_PROCESS_NAME);

    prepend_python_path(container, BOOTSTRAP_PATH);

    let mut extras = vec![
        env(ENV_LICENSE, &spec.license),
        env(ENV_SERVER_HOST, &spec.host),
        env(ENV_SERVER_PORT, &spec.port),
        env(ENV_APP_NAME, &app_name),
        env(ENV_MICRO_ENABLED, "true"),
        env(ENV_HOME, AGENT_MOUNT_PATH),
        env(ENV_AGENT_PATH, AGENT_PATH),
    ];
    if let Some(process_name) = app_process_name {
        extras.push(env(ENV_APP_PROCESS_NAME, &process_name));
    }
    extras.extend(identity_env_vars());
    merge_env_vars(container, extras);

    wrap_command(container);
}

fn target_env(target: &TargetSpec, name: &str) -> Option<String> {
    target
        .envs
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.clone())
        .filter(|v| !v.is_empty())
}

fn prepend_python_path(container: &mut Container, bootstrap: &str) {
    let envs = container.env.get_or_insert_with(Vec::new);
    if let Some(existing) = envs.iter_mut().find(|e| e.name == ENV_PYTHONPATH) {
        if existing.value_from.is_some() {
            warn!(
                container = %container.name,
                "PYTHONPATH comes from a ConfigMap/Secret, skipping bootstrap path"
            );
            return;
        }
        let current = existing.value.take().unwrap_or_default();
        existing.value = Some(if current.is_empty() {
            bootstrap.to_string()
        } else {
            format!("{bootstrap}:{current}")
        });
    } else {
        envs.push(EnvVar {
            name: ENV_PYTHONPATH.to_string(),
            value: Some(bootstrap.to_string()),
            value_from: None,
        });
    }
}

/// Rewrites an explicit container command to run through the launcher,
/// keeping the original command and args as trailing arguments. An image
/// entrypoint we cannot see is left untouched.
fn wrap_command(container: &mut Container) {
    let Some(command) = container.command.take() else {
        debug!(
            container = %container.name,
            "no explicit command, leaving entrypoint unwrapped"
        );
        return;
    };
    if command.is_empty() {
        container.command = Some(command);
        return;
    }

    let mut trailing = command;
    trailing.extend(container.args.take().unwrap_or_default());

    container.command = Some(vec![LAUNCHER_PATH.to_string()]);
    container.args = Some(trailing);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SightlineAgentSpec {
        SightlineAgentSpec {
            license: "lic".to_string(),
            host: "host".to_string(),
            port: "6600".to_string(),
            ..Default::default()
        }
    }

    fn target() -> TargetSpec {
        TargetSpec {
            name: "py".to_string(),
            enabled: true,
            language: crate::crd::Language::Python,
            apm_versions: Default::default(),
            custom_image_full_name: None,
            custom_image_name: None,
            additional_args: Default::default(),
            envs: Vec::new(),
            namespace_selector: Default::default(),
            pod_selector: Default::default(),
            config: Default::default(),
            init_container_security: None,
            image_pull_secrets: Vec::new(),
        }
    }

    #[test]
    fn test_pythonpath_created() {
        let mut c = Container {
            name: "worker".to_string(),
            ..Default::default()
        };
        inject(&mut c, &spec(), &target());
        let envs = c.env.unwrap();
        let path = envs.iter().find(|e| e.name == "PYTHONPATH").unwrap();
        assert_eq!(path.value.as_deref(), Some(BOOTSTRAP_PATH));
    }

    #[test]
    fn test_pythonpath_prepended() {
        let mut c = Container {
            name: "worker".to_string(),
            env: Some(vec![env("PYTHONPATH", "/app/lib")]),
            ..Default::default()
        };
        inject(&mut c, &spec(), &target());
        let envs = c.env.unwrap();
        let path = envs.iter().find(|e| e.name == "PYTHONPATH").unwrap();
        assert_eq!(
            path.value.as_deref(),
            Some("/sightline-agent/sightline/bootstrap:/app/lib")
        );
    }

    #[test]
    fn test_command_wrapped_with_original_preserved() {
        let mut c = Container {
            name: "worker".to_string(),
            command: Some(vec!["python".to_string()]),
            args: Some(vec!["app.py".to_string(), "--port=8000".to_string()]),
            ..Default::default()
        };
        inject(&mut c, &spec(), &target());
        assert_eq!(c.command, Some(vec![LAUNCHER_PATH.to_string()]));
        assert_eq!(
            c.args,
            Some(vec![
                "python".to_string(),
                "app.py".to_string(),
                "--port=8000".to_string()
            ])
        );
    }

    #[test]
    fn test_implicit_entrypoint_not_wrapped() {
        let mut c = Container {
            name: "worker".to_string(),
            args: Some(vec!["app.py".to_string()]),
            ..Default::default()
        };
        inject(&mut c, &spec(), &target());
        assert!(c.command.is_none());
        assert_eq!(c.args, Some(vec!["app.py".to_string()]));
    }

    #[test]
    fn test_app_name_defaults_to_container_name() {
        let mut c = Container {
            name: "worker".to_string(),
            ..Default::default()
        };
        inject(&mut c, &spec(), &target());
        let envs = c.env.unwrap();
        let app = envs.iter().find(|e| e.name == "app_name").unwrap();
        assert_eq!(app.value.as_deref(), Some("worker"));
    }

    #[test]
    fn test_app_name_from_target_envs() {
        let mut c = Container {
            name: "worker".to_string(),
            ..Default::default()
        };
        let mut t = target();
        t.envs = vec![env("app_name", "checkout-api")];
        inject(&mut c, &spec(), &t);
        let envs = c.env.unwrap();
        let app = envs.iter().find(|e| e.name == "app_name").unwrap();
        assert_eq!(app.value.as_deref(), Some("checkout-api"));
    }
}
