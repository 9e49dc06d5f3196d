use thiserror::Error;

use keel_common::{Digest, ReferenceError};
use keel_control::RemoteError;

/// Coarse classification that tells a caller what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network or throttling; safe to re-run.
    Transient,
    /// A resource is absent. Sometimes a valid state, never transient.
    NotFound,
    /// Resource mid-transition or mutated concurrently; wait and re-run.
    Precondition,
    /// Poll budget exhausted. Nothing was rolled back.
    Timeout,
    /// Structural mismatch. Re-running will not change the outcome.
    Consistency,
    Cancelled,
    Fatal,
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("no image tagged '{tag}' in repository '{repository}'")]
    ArtifactNotFound { repository: String, tag: String },

    #[error("registry unavailable: {0}")]
    RegistryUnavailable(#[source] RemoteError),

    #[error("model '{0}' does not exist")]
    ModelMissing(String),

    #[error("{resource} is being modified concurrently: {detail}")]
    ConcurrentModification { resource: String, detail: String },

    #[error("endpoint '{endpoint}' not ready: {reason}")]
    EndpointNotReady { endpoint: String, reason: String },

    #[error("model '{model}' still exists after {attempts} deletion checks")]
    DeletionTimeout { model: String, attempts: u32 },

    #[error("endpoint '{endpoint}' not stable after {attempts} checks (last seen: {last})")]
    RolloutTimeout {
        endpoint: String,
        attempts: u32,
        last: String,
    },

    #[error("endpoint '{endpoint}' rollout failed: {reason}")]
    RolloutFailed { endpoint: String, reason: String },

    #[error("model '{model}' records image '{actual}', requested '{expected}'")]
    ArtifactMismatch {
        model: String,
        expected: String,
        actual: String,
    },

    #[error("endpoint '{endpoint}' runs tag-form image '{reference}', which cannot be tied to an artifact")]
    NonDeterministicReference { endpoint: String, reference: String },

    #[error("endpoint '{endpoint}' runs {deployed}, expected {expected}")]
    DigestMismatch {
        endpoint: String,
        expected: Digest,
        deployed: Digest,
    },

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error("{operation} failed: {source}")]
    Remote {
        operation: &'static str,
        #[source]
        source: RemoteError,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl DeployError {
    pub fn remote(operation: &'static str, source: RemoteError) -> Self {
        Self::Remote { operation, source }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DeployError::RegistryUnavailable(_) => ErrorClass::Transient,
            DeployError::ArtifactNotFound { .. }
            | DeployError::ModelMissing(_) => ErrorClass::NotFound,
            DeployError::ConcurrentModification { .. }
            | DeployError::EndpointNotReady { .. } => ErrorClass::Precondition,
            DeployError::DeletionTimeout { .. } | DeployError::RolloutTimeout { .. } => {
                ErrorClass::Timeout
            }
            DeployError::ArtifactMismatch { .. }
            | DeployError::NonDeterministicReference { .. }
            | DeployError::DigestMismatch { .. } => ErrorClass::Consistency,
            DeployError::RolloutFailed { .. } | DeployError::Reference(_) => ErrorClass::Fatal,
            DeployError::Remote { source, .. } => match source {
                RemoteError::Unavailable(_) => ErrorClass::Transient,
                RemoteError::NotFound { .. } => ErrorClass::NotFound,
                RemoteError::Conflict { .. } => ErrorClass::Precondition,
                RemoteError::Unauthorized(_)
                | RemoteError::Rejected(_)
                | RemoteError::Decode(_) => ErrorClass::Fatal,
            },
            DeployError::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Whether re-running the same stage from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::Precondition | ErrorClass::Timeout
        )
    }

    pub(crate) fn remote_source(&self) -> Option<&RemoteError> {
        match self {
            DeployError::Remote { source, .. } => Some(source),
            _ => None,
        }
    }

    pub(crate) fn is_remote_not_found(&self) -> bool {
        self.remote_source().is_some_and(RemoteError::is_not_found)
    }

    pub(crate) fn is_remote_conflict(&self) -> bool {
        self.remote_source().is_some_and(RemoteError::is_conflict)
    }
}
