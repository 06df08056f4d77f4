use crate::crd::Language;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SightlineError {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("no APM version configured for language {language}")]
    MissingApmVersion { language: Language },

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("webhook server error: {0}")]
    WebhookServer(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GPU helper error: {0}")]
    GpuHelper(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SightlineError {
    /// True when the underlying API error is an optimistic-concurrency
    /// conflict that may succeed on retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SightlineError::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}

pub type Result<T> = std::result::Result<T, SightlineError>;
