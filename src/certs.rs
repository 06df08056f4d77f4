//! Webhook TLS bootstrap.
//!
//! Generates a self-signed CA and one leaf certificate for the admission
//! Service's in-cluster DNS names, once per process lifetime. Validity is
//! effectively unbounded and there is no rotation; the CA material is
//! persisted into a cluster Secret by the reconciler so the trust bundle
//! survives restarts.

use std::fs;
use std::path::Path;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};

use crate::error::{Result, SightlineError};

const CA_COMMON_NAME: &str = "sightline-webhook-ca";

/// PEM-encoded CA and leaf material for the admission listener.
#[derive(Clone)]
pub struct WebhookCertificate {
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
}

impl WebhookCertificate {
    /// Generates a CA and a leaf certificate bound to
    /// `{service}.{namespace}.svc` and its `cluster.local` variant.
    pub fn generate(service: &str, namespace: &str) -> Result<Self> {
        let ca_key = KeyPair::generate()
            .map_err(|e| SightlineError::Certificate(format!("CA key generation failed: {e}")))?;

        let mut ca_params = CertificateParams::default();
        let mut ca_dn = DistinguishedName::new();
        ca_dn.push(
            DnType::CommonName,
            DnValue::Utf8String(CA_COMMON_NAME.to_string()),
        );
        ca_params.distinguished_name = ca_dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        // Effectively unbounded; there is no rotation path.
        ca_params.not_after = rcgen::date_time_ymd(3024, 1, 1);

        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| SightlineError::Certificate(format!("CA self-sign failed: {e}")))?;
        let ca_cert_pem = ca_cert.pem();

        let server_key = KeyPair::generate().map_err(|e| {
            SightlineError::Certificate(format!("server key generation failed: {e}"))
        })?;

        let service_dns = format!("{service}.{namespace}.svc");
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(service_dns.clone()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_after = rcgen::date_time_ymd(3024, 1, 1);
        params.subject_alt_names = [service_dns.clone(), format!("{service_dns}.cluster.local")]
            .iter()
            .map(|san| {
                Ia5String::try_from(san.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        SightlineError::Certificate(format!("invalid DNS name '{san}': {e}"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key)
            .map_err(|e| SightlineError::Certificate(format!("issuer setup failed: {e}")))?;
        let server_cert = params
            .signed_by(&server_key, &issuer)
            .map_err(|e| SightlineError::Certificate(format!("server cert signing failed: {e}")))?;

        Ok(Self {
            ca_cert_pem,
            ca_key_pem: ca_key.serialize_pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
        })
    }

    /// Writes the material into `dir` using the conventional file names the
    /// TLS listener reads.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("ca.crt"), &self.ca_cert_pem)?;
        fs::write(dir.join("ca.key"), &self.ca_key_pem)?;
        fs::write(dir.join("tls.crt"), &self.server_cert_pem)?;
        fs::write(dir.join("tls.key"), &self.server_key_pem)?;
        Ok(())
    }

    /// CA bundle bytes for the webhook registrations.
    pub fn ca_bundle(&self) -> Vec<u8> {
        self.ca_cert_pem.clone().into_bytes()
    }
}
