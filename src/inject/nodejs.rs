//! Node.js injection: the agent picks everything up from env vars, no
//! command rewrite needed.

use k8s_openapi::api::core::v1::Container;

use super::{env, identity_env_vars, merge_env_vars};
use crate::crd::SightlineAgentSpec;

const ENV_LICENSE: &str = "SIGHTLINE_LICENSE";
const ENV_SERVER_HOST: &str = "SIGHTLINE_SERVER_HOST";
const ENV_SERVER_PORT: &str = "SIGHTLINE_SERVER_PORT";
const ENV_MICRO_ENABLED: &str = "SIGHTLINE_MICRO_ENABLED";

pub(super) fn inject(container: &mut Container, spec: &SightlineAgentSpec) {
    let mut extras = vec![
        env(ENV_LICENSE, &spec.license),
        env(ENV_SERVER_HOST, &spec.host),
        env(ENV_SERVER_PORT, &spec.port),
        env(ENV_MICRO_ENABLED, "true"),
    ];
    extras.extend(identity_env_vars());
    merge_env_vars(container, extras);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodejs_envs() {
        let mut c = Container {
            name: "api".to_string(),
            ..Default::default()
        };
        let spec = SightlineAgentSpec {
            license: "lic".to_string(),
            host: "host".to_string(),
            port: "6600".to_string(),
            ..Default::default()
        };
        inject(&mut c, &spec);
        let envs = c.env.unwrap();
        assert!(envs
            .iter()
            .any(|e| e.name == "SIGHTLINE_LICENSE" && e.value.as_deref() == Some("lic")));
        assert!(envs
            .iter()
            .any(|e| e.name == "SIGHTLINE_MICRO_ENABLED" && e.value.as_deref() == Some("true")));
        assert!(envs.iter().any(|e| e.name == "POD_NAME"));
    }
}
