//! Pod mutation handler.
//!
//! Runs synchronously inside the cluster's admission path, so it stays
//! cheap: one read for the SightlineAgent record and at most one for the
//! pod's namespace. Every failure path admits the pod unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::Api;
use tracing::{debug, error, info, warn};

use super::WebhookContext;
use crate::crd::{SightlineAgent, AGENT_RESOURCE_NAME};
use crate::{inject, selector};

pub async fn mutate_pod(
    State(ctx): State<Arc<WebhookContext>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate(&ctx, &req).await;
    Json(response.into_review())
}

async fn mutate(ctx: &WebhookContext, req: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let Some(pod) = req.object.as_ref() else {
        return AdmissionResponse::from(req);
    };

    // Fetch the desired-state record; absence means injection is simply
    // not configured yet.
    let agents: Api<SightlineAgent> = Api::all(ctx.client.clone());
    let record = match agents.get_opt(AGENT_RESOURCE_NAME).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            debug!("no SightlineAgent record, admitting pod unchanged");
            return AdmissionResponse::from(req);
        }
        Err(e) => {
            warn!(error = %e, "failed to read SightlineAgent record, admitting pod unchanged");
            return AdmissionResponse::from(req);
        }
    };

    let instrumentation = &record.spec.features.apm.instrumentation;
    if !instrumentation.enabled || instrumentation.targets.is_empty() {
        return AdmissionResponse::from(req);
    }

    // Re-admission of an already-mutated pod is a no-op.
    if pod
        .spec
        .as_ref()
        .map(inject::is_already_injected)
        .unwrap_or(false)
    {
        debug!(pod = %pod_identifier(pod), "pod already injected, skipping");
        return AdmissionResponse::from(req);
    }

    let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
    let namespace_name = req
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone())
        .unwrap_or_else(|| "default".to_string());

    // The namespace is only looked up (live, once) when some enabled
    // target already matches the pod's own labels.
    let needs_namespace = instrumentation
        .targets
        .iter()
        .any(|t| t.enabled && selector::matches_pod_selector(&pod_labels, &t.pod_selector));
    if !needs_namespace {
        return AdmissionResponse::from(req);
    }

    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let namespace_labels = match namespaces.get(&namespace_name).await {
        Ok(ns) => ns.metadata.labels.unwrap_or_default(),
        Err(e) => {
            warn!(
                namespace = %namespace_name,
                error = %e,
                "failed to read namespace, admitting pod unchanged"
            );
            return AdmissionResponse::from(req);
        }
    };

    let Some(target) = select_target(
        &instrumentation.targets,
        &pod_labels,
        &namespace_name,
        &namespace_labels,
    ) else {
        return AdmissionResponse::from(req);
    };

    let plan = match inject::plan(&record.spec, instrumentation, target) {
        Ok(plan) => plan,
        Err(e) => {
            warn!(
                target = %target.name,
                error = %e,
                "injection planning aborted, admitting pod unchanged"
            );
            return AdmissionResponse::from(req);
        }
    };

    let mut mutated = pod.clone();
    let pod_spec = mutated.spec.get_or_insert_with(Default::default);
    inject::apply_plan(&plan, &record.spec, target, pod_spec);

    let annotations = mutated.metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(inject::ANNOTATION_INJECTED.to_string(), "true".to_string());
    annotations.insert(
        inject::ANNOTATION_LANGUAGE.to_string(),
        plan.language.to_string(),
    );
    annotations.insert(inject::ANNOTATION_VERSION.to_string(), plan.version.clone());

    info!(
        pod = %pod_identifier(pod),
        target = %target.name,
        language = %plan.language,
        version = %plan.version,
        "injected Sightline APM into pod"
    );

    patch_response(req, pod, &mutated)
}

/// First enabled target whose pod and namespace selectors both match;
/// targets after it are never consulted.
pub(crate) fn select_target<'a>(
    targets: &'a [crate::crd::TargetSpec],
    pod_labels: &BTreeMap<String, String>,
    namespace_name: &str,
    namespace_labels: &BTreeMap<String, String>,
) -> Option<&'a crate::crd::TargetSpec> {
    targets.iter().find(|target| {
        target.enabled
            && selector::matches_pod_selector(pod_labels, &target.pod_selector)
            && selector::matches_namespace_selector(
                namespace_name,
                namespace_labels,
                &target.namespace_selector,
            )
    })
}

fn patch_response(req: &AdmissionRequest<Pod>, original: &Pod, mutated: &Pod) -> AdmissionResponse {
    let (original_value, mutated_value) = match (
        serde_json::to_value(original),
        serde_json::to_value(mutated),
    ) {
        (Ok(o), Ok(m)) => (o, m),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "failed to serialize pod for patch, admitting unchanged");
            return AdmissionResponse::from(req);
        }
    };

    let patch = json_patch::diff(&original_value, &mutated_value);
    match AdmissionResponse::from(req).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "failed to serialize patch, admitting unchanged");
            AdmissionResponse::from(req)
        }
    }
}

/// Pods created through a workload controller often have no name yet at
/// admission time; fall back to namespace + generateName.
fn pod_identifier(pod: &Pod) -> String {
    if let Some(name) = pod.metadata.name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    match pod.metadata.generate_name.as_deref().filter(|g| !g.is_empty()) {
        Some(generate_name) => format!("{namespace}/{generate_name}*"),
        None => format!("{namespace}/unknown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Language, PodSelector, TargetSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn target(name: &str, label: (&str, &str)) -> TargetSpec {
        TargetSpec {
            name: name.to_string(),
            enabled: true,
            language: Language::Java,
            apm_versions: Default::default(),
            custom_image_full_name: None,
            custom_image_name: None,
            additional_args: Default::default(),
            envs: Vec::new(),
            namespace_selector: Default::default(),
            pod_selector: PodSelector {
                match_labels: BTreeMap::from([(label.0.to_string(), label.1.to_string())]),
                ..Default::default()
            },
            config: Default::default(),
            init_container_security: None,
            image_pull_secrets: Vec::new(),
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_first_match_wins() {
        let targets = vec![
            target("first", ("app", "web")),
            target("second", ("app", "web")),
        ];
        let selected =
            select_target(&targets, &labels(&[("app", "web")]), "default", &labels(&[]));
        assert_eq!(selected.map(|t| t.name.as_str()), Some("first"));
    }

    #[test]
    fn test_disabled_target_skipped_in_order() {
        let mut first = target("first", ("app", "web"));
        first.enabled = false;
        let targets = vec![first, target("second", ("app", "web"))];
        let selected =
            select_target(&targets, &labels(&[("app", "web")]), "default", &labels(&[]));
        assert_eq!(selected.map(|t| t.name.as_str()), Some("second"));
    }

    #[test]
    fn test_namespace_selector_filters_targets() {
        let mut first = target("first", ("app", "web"));
        first.namespace_selector.match_names = vec!["prod".to_string()];
        let targets = vec![first, target("second", ("app", "web"))];
        let selected =
            select_target(&targets, &labels(&[("app", "web")]), "staging", &labels(&[]));
        assert_eq!(selected.map(|t| t.name.as_str()), Some("second"));
    }

    #[test]
    fn test_no_match_returns_none() {
        let targets = vec![target("only", ("app", "web"))];
        assert!(select_target(&targets, &labels(&[("app", "api")]), "default", &labels(&[]))
            .is_none());
    }

    #[test]
    fn test_pod_identifier_prefers_name() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(pod_identifier(&pod), "web-0");
    }

    #[test]
    fn test_pod_identifier_uses_generate_name() {
        let pod = Pod {
            metadata: ObjectMeta {
                generate_name: Some("web-7f9c4-".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(pod_identifier(&pod), "prod/web-7f9c4-*");
    }

    #[test]
    fn test_pod_identifier_unknown() {
        let pod = Pod {
            metadata: ObjectMeta {
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(pod_identifier(&pod), "prod/unknown");
    }
}
