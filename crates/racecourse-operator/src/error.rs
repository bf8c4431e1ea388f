use std::time::Duration;

use thiserror::Error;

use crate::children::ChildKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[source] kube::Error),
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict { kind: String, name: String, message: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("{kind} {name} is already controlled by {owner}")]
    AlreadyOwned { kind: String, name: String, owner: String },
    #[error("owner {0} has no uid, it must be persisted before it can own children")]
    MissingOwnerUid(String),
    #[error("gave up after {attempts} conflicting attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("failed to reconcile {child}: {source}")]
    Child {
        child: ChildKind,
        #[source]
        source: Box<Error>,
    },
    #[error("failed to reconcile {child}: {cause}; recording the failure also failed: {status}")]
    StatusAfterFailure {
        child: ChildKind,
        #[source]
        cause: Box<Error>,
        status: Box<Error>,
    },
    #[error("reconcile deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("mutation changed the identity of {namespace}/{name}")]
    IdentityChanged { namespace: String, name: String },
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Write rejected because the object moved on since it was read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }

    pub fn child(&self) -> Option<ChildKind> {
        match self {
            Self::Child { child, .. } | Self::StatusAfterFailure { child, .. } => Some(*child),
            _ => None,
        }
    }

    /// Short label used for metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Kube(_) => "kube",
            Self::Conflict { .. } | Self::AlreadyExists { .. } | Self::RetriesExhausted { .. } => "conflict",
            Self::AlreadyOwned { .. } | Self::MissingOwnerUid(_) => "ownership",
            Self::Child { source, .. } => source.metric_label(),
            Self::StatusAfterFailure { .. } => "status",
            Self::DeadlineExceeded(_) => "deadline",
            Self::Serialization(_) => "serialization",
            Self::IdentityChanged { .. } => "invariant",
            Self::Config(_) => "config",
        }
    }
}

impl Error {
    /// Classify an API error raised while writing `kind` `name`.
    pub fn from_api(e: kube::Error, kind: &str, name: &str) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists { kind: kind.into(), name: name.into() }
            }
            kube::Error::Api(ae) if ae.code == 409 => {
                Self::Conflict { kind: kind.into(), name: name.into(), message: ae.message }
            }
            other => Self::Kube(other),
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self { Self::from_api(e, "object", "") }
}
