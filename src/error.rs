use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure categories used to pick log severity and retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Protocol,
    Transport,
    KubeRead,
    KubeWrite,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("registry {registry:?} referenced by image {image} is not configured")]
    RegistryNotFound { image: String, registry: String },

    #[error("environment variable {variable} referenced by registry credentials is not set")]
    MissingEnvVar { variable: String },

    #[error("malformed auth challenge from {registry}: {reason}")]
    MalformedChallenge { registry: String, reason: String },

    #[error("registry {registry} requested unsupported auth scheme {scheme}")]
    UnsupportedAuthScheme { registry: String, scheme: String },

    #[error("token request to {realm} failed with status {status}")]
    TokenRequest { realm: String, status: StatusCode },

    #[error("token response from {realm} contains neither token nor access_token")]
    MissingToken { realm: String },

    #[error("registry request {url} failed with status {status}: {body}")]
    RegistryRequest {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("failed to decode manifest from {url}: {source}")]
    ManifestDecode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest from {url} carries no digest")]
    MissingDigest { url: String },

    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("deployment {namespace}/{name} not found")]
    DeploymentNotFound { namespace: String, name: String },

    #[error(
        "container {container} not found in deployment {namespace}/{name} or no ready running pods found"
    )]
    ContainerNotFound {
        namespace: String,
        name: String,
        container: String,
    },

    #[error("failed to read state of deployment {namespace}/{name}: {source}")]
    KubeRead {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to restart deployment {namespace}/{name}: {source}")]
    RestartFailed {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RegistryNotFound { .. } | Error::MissingEnvVar { .. } => {
                ErrorKind::Configuration
            }
            Error::MalformedChallenge { .. }
            | Error::UnsupportedAuthScheme { .. }
            | Error::TokenRequest { .. }
            | Error::MissingToken { .. }
            | Error::RegistryRequest { .. }
            | Error::ManifestDecode { .. }
            | Error::MissingDigest { .. } => ErrorKind::Protocol,
            Error::Transport(_) => ErrorKind::Transport,
            Error::DeploymentNotFound { .. }
            | Error::ContainerNotFound { .. }
            | Error::KubeRead { .. } => ErrorKind::KubeRead,
            Error::RestartFailed { .. } => ErrorKind::KubeWrite,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Expected while a rollout is in progress; retried on the next cycle without escalation.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            Error::DeploymentNotFound { .. } | Error::ContainerNotFound { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
