//! Label and namespace selector evaluation.
//!
//! Pure predicate logic: no cluster access, no side effects. The pod
//! mutator relies on this determinism for its idempotence guarantee.

use std::collections::BTreeMap;

use crate::crd::{LabelSelectorRequirement, NamespaceSelector, PodSelector, SelectorOperator};

/// True when `labels` satisfy every clause of the pod selector. An empty
/// selector matches everything.
pub fn matches_pod_selector(labels: &BTreeMap<String, String>, selector: &PodSelector) -> bool {
    has_labels(labels, &selector.match_labels)
        && matches_expressions(labels, &selector.match_expressions)
}

/// True when the namespace (by name and labels) satisfies every clause of
/// the namespace selector. An empty `matchNames` list matches any
/// namespace name.
pub fn matches_namespace_selector(
    name: &str,
    labels: &BTreeMap<String, String>,
    selector: &NamespaceSelector,
) -> bool {
    matches_names(name, &selector.match_names)
        && has_labels(labels, &selector.match_labels)
        && matches_expressions(labels, &selector.match_expressions)
}

fn matches_names(name: &str, match_names: &[String]) -> bool {
    match_names.is_empty() || match_names.iter().any(|n| n == name)
}

fn has_labels(labels: &BTreeMap<String, String>, required: &BTreeMap<String, String>) -> bool {
    required
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

fn matches_expressions(
    labels: &BTreeMap<String, String>,
    expressions: &[LabelSelectorRequirement],
) -> bool {
    expressions.iter().all(|req| matches_expression(labels, req))
}

fn matches_expression(labels: &BTreeMap<String, String>, req: &LabelSelectorRequirement) -> bool {
    match req.operator {
        // In requires the key to exist with one of the listed values.
        SelectorOperator::In => labels
            .get(&req.key)
            .map(|v| req.values.contains(v))
            .unwrap_or(false),
        // NotIn treats a missing key as a pass.
        SelectorOperator::NotIn => labels
            .get(&req.key)
            .map(|v| !req.values.contains(v))
            .unwrap_or(true),
        SelectorOperator::Exists => labels.contains_key(&req.key),
        SelectorOperator::DoesNotExist => !labels.contains_key(&req.key),
    }
}
