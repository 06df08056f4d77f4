//! Webhook lifecycle: the admission Service, the TLS Secret carrying the
//! bootstrapped certificate (CA key included, so the bundle survives
//! restarts), and the webhook registrations pointing the API server at the
//! admission endpoints.
//!
//! Both registrations use failure policy Ignore: if the operator is down,
//! pods are admitted uninstrumented rather than blocked.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::Api;

use super::Context;
use crate::certs::WebhookCertificate;
use crate::error::Result;
use crate::webhook::{MUTATE_POD_PATH, VALIDATE_AGENT_PATH};

pub const TLS_SECRET_NAME: &str = "sightline-webhook-tls";
pub const MUTATING_WEBHOOK_NAME: &str = "sightline-pod-injector";
pub const VALIDATING_WEBHOOK_NAME: &str = "sightline-agent-validator";

/// Label selecting the operator pod behind the admission Service.
const OPERATOR_APP_LABEL: &str = "sightline-operator";
const WEBHOOK_TIMEOUT_SECONDS: i32 = 10;

pub(super) async fn ensure(ctx: &Context, namespace: &str, owner: &OwnerReference) -> Result<()> {
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    super::create_or_update(
        &services,
        admission_service(&ctx.config.webhook_service_name, namespace, ctx.config.webhook_port, owner),
    )
    .await?;

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    super::create_or_update(&secrets, tls_secret(&ctx.certs, namespace, owner)).await?;

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(ctx.client.clone());
    super::create_or_update(
        &mutating,
        mutating_webhook_config(&ctx.certs, &ctx.config.webhook_service_name, namespace, owner),
    )
    .await?;

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(ctx.client.clone());
    super::create_or_update(
        &validating,
        validating_webhook_config(&ctx.certs, &ctx.config.webhook_service_name, namespace, owner),
    )
    .await?;

    Ok(())
}

fn admission_service(
    name: &str,
    namespace: &str,
    target_port: u16,
    owner: &OwnerReference,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                OPERATOR_APP_LABEL.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: 443,
                target_port: Some(IntOrString::Int(target_port as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tls_secret(certs: &WebhookCertificate, namespace: &str, owner: &OwnerReference) -> Secret {
    let entry = |value: &str| ByteString(value.as_bytes().to_vec());
    Secret {
        metadata: ObjectMeta {
            name: Some(TLS_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            ("tls.crt".to_string(), entry(&certs.server_cert_pem)),
            ("tls.key".to_string(), entry(&certs.server_key_pem)),
            ("ca.crt".to_string(), entry(&certs.ca_cert_pem)),
            ("ca.key".to_string(), entry(&certs.ca_key_pem)),
        ])),
        ..Default::default()
    }
}

fn mutating_webhook_config(
    certs: &WebhookCertificate,
    service_name: &str,
    namespace: &str,
    owner: &OwnerReference,
) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(MUTATING_WEBHOOK_NAME.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: "inject.monitoring.sightline.io".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            client_config: WebhookClientConfig {
                ca_bundle: Some(ByteString(certs.ca_bundle())),
                service: Some(ServiceReference {
                    name: service_name.to_string(),
                    namespace: namespace.to_string(),
                    path: Some(MUTATE_POD_PATH.to_string()),
                    port: Some(443),
                }),
                url: None,
            },
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec!["".to_string()]),
                api_versions: Some(vec!["v1".to_string()]),
                operations: Some(vec!["CREATE".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: Some("Namespaced".to_string()),
            }]),
            failure_policy: Some("Ignore".to_string()),
            side_effects: "None".to_string(),
            timeout_seconds: Some(WEBHOOK_TIMEOUT_SECONDS),
            ..Default::default()
        }]),
    }
}

fn validating_webhook_config(
    certs: &WebhookCertificate,
    service_name: &str,
    namespace: &str,
    owner: &OwnerReference,
) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(VALIDATING_WEBHOOK_NAME.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        webhooks: Some(vec![ValidatingWebhook {
            name: "validate.monitoring.sightline.io".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            client_config: WebhookClientConfig {
                ca_bundle: Some(ByteString(certs.ca_bundle())),
                service: Some(ServiceReference {
                    name: service_name.to_string(),
                    namespace: namespace.to_string(),
                    path: Some(VALIDATE_AGENT_PATH.to_string()),
                    port: Some(443),
                }),
                url: None,
            },
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec!["monitoring.sightline.io".to_string()]),
                api_versions: Some(vec!["v1alpha1".to_string()]),
                operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
                resources: Some(vec!["sightlineagents".to_string()]),
                scope: Some("Cluster".to_string()),
            }]),
            failure_policy: Some("Ignore".to_string()),
            side_effects: "None".to_string(),
            timeout_seconds: Some(WEBHOOK_TIMEOUT_SECONDS),
            ..Default::default()
        }]),
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

    fn certs() -> WebhookCertificate {
        WebhookCertificate {
            ca_cert_pem: "ca-cert".to_string(),
            ca_key_pem: "ca-key".to_string(),
            server_cert_pem: "server-cert".to_string(),
            server_key_pem: "server-key".to_string(),
        }
    }

    #[test]
    fn test_mutating_webhook_fails_open() {
        let config = mutating_webhook_config(&certs(), "sightline-admission", "ns", &owner());
        let webhook = &config.webhooks.unwrap()[0];
        assert_eq!(webhook.failure_policy.as_deref(), Some("Ignore"));
        assert_eq!(
            webhook
                .client_config
                .service
                .as_ref()
                .unwrap()
                .path
                .as_deref(),
            Some("/inject-pod")
        );
        assert_eq!(
            webhook.client_config.ca_bundle.as_ref().unwrap().0,
            b"ca-cert".to_vec()
        );
    }

    #[test]
    fn test_validating_webhook_targets_records() {
        let config = validating_webhook_config(&certs(), "sightline-admission", "ns", &owner());
        let webhook = &config.webhooks.unwrap()[0];
        let rule = &webhook.rules.as_ref().unwrap()[0];
        assert_eq!(
            rule.resources.as_ref().unwrap(),
            &vec!["sightlineagents".to_string()]
        );
        assert_eq!(
            rule.operations.as_ref().unwrap(),
            &vec!["CREATE".to_string(), "UPDATE".to_string()]
        );
    }

    #[test]
    fn test_tls_secret_carries_ca_material() {
        let secret = tls_secret(&certs(), "ns", &owner());
        let data = secret.data.unwrap();
        for key in ["tls.crt", "tls.key", "ca.crt", "ca.key"] {
            assert!(data.contains_key(key), "{key} missing from TLS secret");
        }
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
    }

    #[test]
    fn test_admission_service_routes_to_webhook_port() {
        let service = admission_service("sightline-admission", "ns", 9443, &owner());
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 443);
        assert_eq!(port.target_port, Some(IntOrString::Int(9443)));
    }
}
