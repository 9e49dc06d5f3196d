use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use keel_common::{ArtifactReference, Digest, Selector};
use keel_control::{Registry, RemoteError};

use crate::clock::Clock;
use crate::error::DeployError;
use crate::poll::{retry_transient, RetryPolicy};

/// Turns mutable tags into immutable content digests.
#[derive(Clone)]
pub struct ArtifactResolver {
    registry: Arc<dyn Registry>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl ArtifactResolver {
    pub fn new(registry: Arc<dyn Registry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Digest selectors are returned as-is without touching the registry.
    pub async fn resolve(
        &self,
        repository: &str,
        selector: &Selector,
        cancel: &CancellationToken,
    ) -> Result<Digest, DeployError> {
        let tag = match selector {
            Selector::Digest(d) => return Ok(d.clone()),
            Selector::Tag(t) => t.as_str(),
        };

        let registry = &self.registry;
        let image = retry_transient(
            self.clock.as_ref(),
            &self.retry,
            cancel,
            "describe image",
            move || async move { registry.describe_image_by_tag(repository, tag).await },
        )
        .await
        .map_err(|e| match e {
            DeployError::Remote {
                source: RemoteError::NotFound { .. },
                ..
            } => DeployError::ArtifactNotFound {
                repository: repository.to_string(),
                tag: tag.to_string(),
            },
            DeployError::Remote {
                source: source @ (RemoteError::Unavailable(_) | RemoteError::Unauthorized(_)),
                ..
            } => DeployError::RegistryUnavailable(source),
            other => other,
        })?;

        tracing::info!(repository, tag, digest = %image.digest, "resolved tag");
        Ok(image.digest)
    }

    /// Same registry and repository, pinned to the resolved digest.
    pub async fn resolve_reference(
        &self,
        reference: &ArtifactReference,
        cancel: &CancellationToken,
    ) -> Result<ArtifactReference, DeployError> {
        if reference.is_pinned() {
            return Ok(reference.clone());
        }
        let digest = self
            .resolve(&reference.repository, &reference.selector, cancel)
            .await?;
        Ok(reference.pinned(digest))
    }
}
