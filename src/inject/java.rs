//! Java injection: the agent attaches through `JAVA_TOOL_OPTIONS`, so the
//! `-javaagent` flag must be appended to any options the container already
//! sets rather than replacing them.

use k8s_openapi::api::core::v1::{Container, EnvVar};
use tracing::warn;

use super::{env, identity_env_vars, merge_env_vars};
use crate::crd::SightlineAgentSpec;

const ENV_LICENSE: &str = "license";
const ENV_SERVER_HOST: &str = "sightline.server.host";
const ENV_SERVER_PORT: &str = "sightline.server.port";
const ENV_MICRO_ENABLED: &str = "sightline.micro.enabled";
const ENV_TOOL_OPTIONS: &str = "JAVA_TOOL_OPTIONS";
const ENV_AGENT_PATH: &str = "SIGHTLINE_JAVA_AGENT_PATH";
const AGENT_JAR_PATH: &str = "/sightline-agent/sightline.agent.java.jar";
const AGENT_OPTION_PREFIX: &str = "-javaagent:";

pub(super) fn inject(container: &mut Container, spec: &SightlineAgentSpec) {
    append_tool_options(container, &format!("{AGENT_OPTION_PREFIX}{AGENT_JAR_PATH}"));

    let mut extras = vec![
        env(ENV_LICENSE, &spec.license),
        env(ENV_SERVER_HOST, &spec.host),
        env(ENV_SERVER_PORT, &spec.port),
        env(ENV_MICRO_ENABLED, "true"),
        env(ENV_AGENT_PATH, AGENT_JAR_PATH),
    ];
    extras.extend(identity_env_vars());
    merge_env_vars(container, extras);
}

fn append_tool_options(container: &mut Container, agent_option: &str) {
    let envs = container.env.get_or_insert_with(Vec::new);
    if let Some(existing) = envs.iter_mut().find(|e| e.name == ENV_TOOL_OPTIONS) {
        if existing.value_from.is_some() {
            warn!(
                container = %container.name,
                "JAVA_TOOL_OPTIONS comes from a ConfigMap/Secret, skipping agent option"
            );
            return;
        }
        let current = existing.value.take().unwrap_or_default();
        existing.value = Some(if current.is_empty() {
            agent_option.to_string()
        } else {
            format!("{current} {agent_option}")
        });
    } else {
        envs.push(EnvVar {
            name: ENV_TOOL_OPTIONS.to_string(),
            value: Some(agent_option.to_string()),
            value_from: None,
        });
    }
}
