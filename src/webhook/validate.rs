//! SightlineAgent record validation.
//!
//! The record is a cluster-wide singleton; anything not named `sightline`
//! is rejected, as are enabled targets that could never produce a working
//! injection plan.

use axum::Json;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::ResourceExt;
use tracing::{error, info};

use crate::crd::{ConfigMode, SightlineAgent, SightlineAgentSpec, AGENT_RESOURCE_NAME};

pub async fn validate_agent(
    Json(review): Json<AdmissionReview<SightlineAgent>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<SightlineAgent> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = AdmissionResponse::from(&req);
    let Some(agent) = req.object.as_ref() else {
        // Deletion carries no object and needs no validation.
        return Json(response.into_review());
    };

    info!(name = %agent.name_any(), operation = ?req.operation, "validating SightlineAgent");

    if agent.name_any() != AGENT_RESOURCE_NAME {
        return Json(
            response
                .deny(format!(
                    "SightlineAgent must be named '{AGENT_RESOURCE_NAME}', got '{}'",
                    agent.name_any()
                ))
                .into_review(),
        );
    }

    if let Err(reason) = validate_spec(&agent.spec) {
        return Json(response.deny(reason).into_review());
    }

    Json(response.into_review())
}

/// Checks every enabled instrumentation target for the mistakes that would
/// make planning fail on each matching pod.
fn validate_spec(spec: &SightlineAgentSpec) -> Result<(), String> {
    for (i, target) in spec
        .features
        .apm
        .instrumentation
        .targets
        .iter()
        .enumerate()
    {
        if !target.enabled {
            continue;
        }
        if target.name.is_empty() {
            return Err(format!("target[{i}]: name is required"));
        }
        match target.apm_versions.get(&target.language) {
            Some(version) if !version.is_empty() => {}
            _ => {
                return Err(format!(
                    "target[{i}]: apmVersions must include an entry for language '{}'",
                    target.language
                ))
            }
        }
        if target.config.mode == ConfigMode::Custom {
            match &target.config.config_map_ref {
                Some(reference) if !reference.name.is_empty() => {}
                _ => {
                    return Err(format!(
                        "target[{i}]: configMapRef with a name is required when config mode is 'custom'"
                    ))
                }
            }
        }
    }
    Ok(())
}
