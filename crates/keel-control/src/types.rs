use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use keel_common::{Digest, Endpoint, ModelResource, ServingConfiguration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Image,
    Model,
    ServingConfiguration,
    Endpoint,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Image => "image",
            ResourceKind::Model => "model",
            ResourceKind::ServingConfiguration => "serving configuration",
            ResourceKind::Endpoint => "endpoint",
        })
    }
}

/// Failure reported by (or while talking to) a remote control plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    /// The resource is being mutated by someone else (in transition, already
    /// exists, already deleting).
    #[error("conflict on {kind} '{name}': {message}")]
    Conflict {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    /// Transport failure, throttling or a 5xx.
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(kind: ResourceKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Worth retrying the same call unchanged after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescription {
    pub repository: String,
    pub tag: String,
    pub digest: Digest,
}

/// A model as the hosting platform recorded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub name: String,
    /// Image URI exactly as stored by the platform.
    pub image: String,
    pub execution_role: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn describe_image_by_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<ImageDescription, RemoteError>;
}

/// Managed-inference hosting operations.
///
/// Mutations are asynchronous on the platform side: a successful call only
/// means the operation was accepted, and subsequent describes may lag.
#[async_trait]
pub trait HostingPlatform: Send + Sync {
    async fn describe_model(&self, name: &str) -> Result<ModelDescription, RemoteError>;
    async fn delete_model(&self, name: &str) -> Result<(), RemoteError>;
    async fn create_model(&self, model: &ModelResource) -> Result<(), RemoteError>;

    async fn create_serving_configuration(
        &self,
        config: &ServingConfiguration,
    ) -> Result<(), RemoteError>;

    async fn describe_endpoint(&self, name: &str) -> Result<Endpoint, RemoteError>;
    async fn create_endpoint(&self, name: &str, configuration: &str) -> Result<(), RemoteError>;
    async fn update_endpoint(&self, name: &str, configuration: &str) -> Result<(), RemoteError>;
}
