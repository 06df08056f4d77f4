//! SightlineAgent reconciler.
//!
//! Level-triggered control loop keyed by the record: invoked on record
//! changes, on changes to any resource it owns, and on a fixed 5-minute
//! requeue for drift correction. Each pass walks every feature toggle and
//! converges the corresponding managed resource, manages the webhook
//! lifecycle, and records an Available condition. On deletion it removes
//! all managed resources best-effort before releasing the finalizer.

pub mod agents;
pub mod open_agent;
pub mod scrape;
pub mod webhook_infra;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::certs::WebhookCertificate;
use crate::config::OperatorConfig;
use crate::crd::{AgentCondition, SightlineAgent, SightlineAgentStatus};
use crate::error::{Result, SightlineError};

pub const FINALIZER: &str = "monitoring.sightline.io/cleanup";

/// Drift-correction interval.
const REQUEUE_INTERVAL: Duration = Duration::from_secs(300);
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);
const STATUS_UPDATE_ATTEMPTS: u64 = 3;

/// Dependencies shared by every reconcile invocation.
pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
    pub certs: WebhookCertificate,
}

/// Runs the controller until shutdown. Serialization of reconciles per
/// record identity is the runtime's guarantee.
pub async fn run(ctx: Arc<Context>) {
    let agents: Api<SightlineAgent> = Api::all(ctx.client.clone());

    Controller::new(agents, watcher::Config::default())
        .owns(
            Api::<Deployment>::all(ctx.client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<DaemonSet>::all(ctx.client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<Service>::all(ctx.client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<ConfigMap>::all(ctx.client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<Secret>::all(ctx.client.clone()),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((record, action)) => {
                    debug!(record = %record.name, ?action, "reconciliation completed")
                }
                Err(e) => error!(error = %e, "reconciliation error"),
            }
        })
        .await;
}

pub async fn reconcile(agent: Arc<SightlineAgent>, ctx: Arc<Context>) -> Result<Action> {
    let name = agent.name_any();
    let api: Api<SightlineAgent> = Api::all(ctx.client.clone());

    if agent.metadata.deletion_timestamp.is_some() {
        info!(record = %name, "record is being deleted, removing managed resources");
        cleanup(&ctx, &agent).await;
        remove_finalizer(&api, &agent).await?;
        return Ok(Action::await_change());
    }

    ensure_finalizer(&api, &agent).await?;

    info!(record = %name, "reconciling SightlineAgent");
    match apply(&ctx, &agent).await {
        Ok(()) => {
            update_status(&api, &name, true, "ReconcileSucceeded", "all enabled components applied")
                .await?;
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Err(e) => {
            if let Err(status_err) =
                update_status(&api, &name, false, "ReconcileError", &e.to_string()).await
            {
                warn!(record = %name, error = %status_err, "failed to record error condition");
            }
            Err(e)
        }
    }
}

pub fn error_policy(agent: Arc<SightlineAgent>, error: &SightlineError, _ctx: Arc<Context>) -> Action {
    warn!(record = %agent.name_any(), error = %error, "reconcile failed, requeueing");
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

/// One full pass over every feature toggle.
async fn apply(ctx: &Context, agent: &SightlineAgent) -> Result<()> {
    let spec = &agent.spec;
    let namespace = workload_namespace(ctx, agent);
    let owner = owner_reference(agent)?;

    if ctx.config.enable_webhooks {
        webhook_infra::ensure(ctx, &namespace, &owner).await?;
    }

    agents::reconcile_master_agent(ctx, spec, &namespace, &owner).await?;
    agents::reconcile_node_agent(ctx, spec, &namespace, &owner).await?;
    agents::reconcile_gpu_service(ctx, spec, &namespace, &owner).await?;
    agents::reconcile_monitor_stubs(ctx, spec, &namespace, &owner).await?;
    open_agent::reconcile(ctx, spec, &namespace, &owner).await?;

    Ok(())
}

fn workload_namespace(ctx: &Context, agent: &SightlineAgent) -> String {
    agent
        .spec
        .features
        .k8s_agent
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| ctx.config.default_namespace.clone())
}

fn owner_reference(agent: &SightlineAgent) -> Result<OwnerReference> {
    agent
        .controller_owner_ref(&())
        .ok_or_else(|| SightlineError::Config("record has no uid yet".to_string()))
}

async fn ensure_finalizer(api: &Api<SightlineAgent>, agent: &SightlineAgent) -> Result<()> {
    if agent.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let mut finalizers = agent.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &agent.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn remove_finalizer(api: &Api<SightlineAgent>, agent: &SightlineAgent) -> Result<()> {
    if !agent.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let finalizers: Vec<String> = agent
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &agent.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Deletes every managed resource class. Individual failures are logged
/// and do not block finalizer removal, so cleanup is best-effort only.
async fn cleanup(ctx: &Context, agent: &SightlineAgent) {
    let namespace = workload_namespace(ctx, agent);
    let client = &ctx.client;

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    best_effort_delete(&deployments, agents::MASTER_AGENT_NAME).await;
    best_effort_delete(&deployments, open_agent::OPEN_AGENT_NAME).await;

    let daemon_sets: Api<DaemonSet> = Api::namespaced(client.clone(), &namespace);
    best_effort_delete(&daemon_sets, agents::NODE_AGENT_NAME).await;

    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    best_effort_delete(&services, agents::GPU_SERVICE_NAME).await;
    best_effort_delete(&services, &ctx.config.webhook_service_name).await;

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    for name in agents::MONITOR_STUB_NAMES {
        best_effort_delete(&config_maps, name).await;
    }
    best_effort_delete(&config_maps, open_agent::CONFIG_MAP_NAME).await;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    best_effort_delete(&secrets, webhook_infra::TLS_SECRET_NAME).await;

    let service_accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), &namespace);
    best_effort_delete(&service_accounts, open_agent::OPEN_AGENT_NAME).await;

    let cluster_roles: Api<ClusterRole> = Api::all(client.clone());
    best_effort_delete(&cluster_roles, open_agent::OPEN_AGENT_NAME).await;

    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    best_effort_delete(&bindings, open_agent::OPEN_AGENT_NAME).await;

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    best_effort_delete(&mutating, webhook_infra::MUTATING_WEBHOOK_NAME).await;

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    best_effort_delete(&validating, webhook_infra::VALIDATING_WEBHOOK_NAME).await;
}

async fn best_effort_delete<K>(api: &Api<K>, name: &str)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => info!(kind = %K::kind(&()), name, "deleted managed resource"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => warn!(kind = %K::kind(&()), name, error = %e, "cleanup deletion failed, continuing"),
    }
}

/// Creates the resource when absent, patches it when the rendered fields
/// drifted, and leaves it alone otherwise.
pub(crate) async fn create_or_update<K>(api: &Api<K>, desired: K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or_else(|| SightlineError::Config("managed resource has no name".to_string()))?;

    match api.get_opt(&name).await? {
        None => {
            api.create(&PostParams::default(), &desired).await?;
            info!(kind = %K::kind(&()), name = %name, "created managed resource");
        }
        Some(existing) => {
            if has_drift(&existing, &desired)? {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&desired))
                    .await?;
                info!(kind = %K::kind(&()), name = %name, "updated managed resource");
            } else {
                debug!(kind = %K::kind(&()), name = %name, "managed resource unchanged");
            }
        }
    }
    Ok(())
}

/// Deletes the resource backing a disabled toggle so it is never left
/// orphaned.
pub(crate) async fn delete_if_present<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(kind = %K::kind(&()), name, "deleted disabled component");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Compares only the fields this operator renders; server-populated
/// metadata and status stay out of the comparison.
fn has_drift<K: Serialize>(existing: &K, desired: &K) -> Result<bool> {
    let existing = serde_json::to_value(existing)?;
    let desired = serde_json::to_value(desired)?;

    for key in [
        "spec", "data", "rules", "roleRef", "subjects", "webhooks", "type",
    ] {
        if let Some(want) = desired.get(key) {
            if existing.get(key) != Some(want) {
                return Ok(true);
            }
        }
    }

    for key in ["labels", "annotations"] {
        let want = desired.get("metadata").and_then(|m| m.get(key));
        if let Some(serde_json::Value::Object(want)) = want {
            let have = existing.get("metadata").and_then(|m| m.get(key));
            for (k, v) in want {
                let present = have
                    .and_then(|h| h.get(k))
                    .map(|current| current == v)
                    .unwrap_or(false);
                if !present {
                    return Ok(true);
                }
            }
        }
    }

    Ok(false)
}

/// Read-modify-write of the Available condition with bounded conflict
/// retry.
async fn update_status(
    api: &Api<SightlineAgent>,
    name: &str,
    available: bool,
    reason: &str,
    message: &str,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let latest = api.get(name).await?;
        let status = SightlineAgentStatus {
            conditions: vec![AgentCondition {
                type_: "Available".to_string(),
                status: if available { "True" } else { "False" }.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
            }],
            observed_generation: latest.metadata.generation,
        };
        let patch = json!({"status": status});
        match api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < STATUS_UPDATE_ATTEMPTS => {
                debug!(record = %name, attempt, "status update conflict, retrying");
                tokio::time::sleep(Duration::from_millis(100 * attempt)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
