use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use keel_common::{ArtifactReference, ModelResource, PollingSettings};
use keel_control::{HostingPlatform, ModelDescription, RemoteError};

use crate::clock::Clock;
use crate::error::DeployError;
use crate::poll::{poll_until, retry_transient, PollError, PollPolicy, PollStep, RetryPolicy};

/// Replaces a named model so that it references the desired artifact.
///
/// The platform cannot repoint a model, so an existing model is deleted and
/// its absence confirmed before the replacement is created.
#[derive(Clone)]
pub struct ModelLifecycleManager {
    hosting: Arc<dyn HostingPlatform>,
    clock: Arc<dyn Clock>,
    deletion: PollPolicy,
    retry: RetryPolicy,
}

impl ModelLifecycleManager {
    pub fn new(hosting: Arc<dyn HostingPlatform>, clock: Arc<dyn Clock>) -> Self {
        Self {
            hosting,
            clock,
            deletion: PollPolicy::deletion(&PollingSettings::default()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_deletion_policy(mut self, policy: PollPolicy) -> Self {
        self.deletion = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn ensure_model(
        &self,
        desired: &ModelResource,
        cancel: &CancellationToken,
    ) -> Result<ModelResource, DeployError> {
        let name = desired.name.as_str();

        if let Some(existing) = self.probe(name, cancel).await? {
            tracing::info!(model = %name, previous_image = %existing.image, "model exists, replacing");
            self.delete(name, cancel).await?;
            self.await_deletion(name, cancel).await?;
        }

        let hosting = &self.hosting;
        match retry_transient(self.clock.as_ref(), &self.retry, cancel, "create model", move || async move {
            hosting.create_model(desired).await
        })
        .await
        {
            Ok(()) => {}
            Err(e) if e.is_remote_conflict() => {
                return Err(DeployError::ConcurrentModification {
                    resource: format!("model '{name}'"),
                    detail: "re-created by another writer after deletion was confirmed".into(),
                })
            }
            Err(e) => return Err(e),
        }
        tracing::info!(model = %name, image = %desired.artifact, "model created");

        let recorded = match self.probe(name, cancel).await? {
            Some(m) => m,
            None => {
                return Err(DeployError::ConcurrentModification {
                    resource: format!("model '{name}'"),
                    detail: "deleted immediately after creation".into(),
                })
            }
        };
        let artifact = check_recorded_image(desired, &recorded)?;

        Ok(ModelResource {
            name: recorded.name,
            artifact,
            execution_identity: recorded.execution_role,
            environment: recorded.environment,
        })
    }

    async fn probe(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ModelDescription>, DeployError> {
        let hosting = &self.hosting;
        match retry_transient(self.clock.as_ref(), &self.retry, cancel, "describe model", move || async move {
            hosting.describe_model(name).await
        })
        .await
        {
            Ok(m) => Ok(Some(m)),
            Err(e) if e.is_remote_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, name: &str, cancel: &CancellationToken) -> Result<(), DeployError> {
        let hosting = &self.hosting;
        match retry_transient(self.clock.as_ref(), &self.retry, cancel, "delete model", move || async move {
            hosting.delete_model(name).await
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_remote_not_found() => {
                tracing::info!(model = %name, "model already deleted by another writer");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn await_deletion(&self, name: &str, cancel: &CancellationToken) -> Result<(), DeployError> {
        let hosting = &self.hosting;
        let result = poll_until(self.clock.as_ref(), &self.deletion, cancel, move |attempt| async move {
            tracing::debug!(model = %name, attempt, "checking deletion");
            deletion_step(hosting.describe_model(name).await)
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!(model = %name, "deletion confirmed");
                Ok(())
            }
            Err(PollError::Exhausted { attempts, .. }) => Err(DeployError::DeletionTimeout {
                model: name.to_string(),
                attempts,
            }),
            Err(PollError::Cancelled) => Err(DeployError::Cancelled),
            Err(PollError::Aborted(e)) => Err(e),
        }
    }
}

/// Deleted once the platform stops returning the model.
fn deletion_step(describe: Result<ModelDescription, RemoteError>) -> Result<PollStep<()>, DeployError> {
    match describe {
        Err(e) if e.is_not_found() => Ok(PollStep::Ready(())),
        Ok(_) => Ok(PollStep::Pending("model still exists".into())),
        Err(e) if e.is_transient() => Ok(PollStep::Pending(format!("describe failed: {e}"))),
        Err(e) => Err(DeployError::remote("describe model", e)),
    }
}

/// The platform must have recorded exactly the requested image reference.
fn check_recorded_image(
    desired: &ModelResource,
    recorded: &ModelDescription,
) -> Result<ArtifactReference, DeployError> {
    let mismatch = || DeployError::ArtifactMismatch {
        model: desired.name.clone(),
        expected: desired.artifact.uri(),
        actual: recorded.image.clone(),
    };
    let actual = ArtifactReference::parse(&recorded.image).map_err(|_| mismatch())?;
    if actual != desired.artifact {
        return Err(mismatch());
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorClass;
    use keel_common::{Digest, Selector};
    use keel_control::{Call, CallOutcome, MemoryControlPlane, ResourceKind};

    fn model(digest: &str) -> ModelResource {
        let artifact = ArtifactReference::new(
            "registry.local",
            "analyzer",
            Selector::Digest(Digest::parse(digest).unwrap()),
        );
        ModelResource::new("m1", artifact, "role").with_env("SERVING_PROGRAM", "serve.py")
    }

    fn manager(cp: &MemoryControlPlane, clock: Arc<ManualClock>) -> ModelLifecycleManager {
        ModelLifecycleManager::new(Arc::new(cp.clone()), clock)
    }

    #[test]
    fn test_deletion_step() {
        let gone = deletion_step(Err(RemoteError::not_found(ResourceKind::Model, "m1"))).unwrap();
        assert_eq!(gone, PollStep::Ready(()));
        let throttled = deletion_step(Err(RemoteError::Unavailable("429".into()))).unwrap();
        assert!(matches!(throttled, PollStep::Pending(_)));
        assert!(deletion_step(Err(RemoteError::Unauthorized("no".into()))).is_err());
    }

    #[test]
    fn test_tag_recorded_for_digest_request_is_mismatch() {
        let desired = model("sha256:aa");
        let recorded = ModelDescription {
            name: "m1".into(),
            image: "registry.local/analyzer:latest".into(),
            execution_role: "role".into(),
            environment: Default::default(),
        };
        let err = check_recorded_image(&desired, &recorded).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Consistency);
    }

    #[tokio::test]
    async fn test_create_when_absent() {
        let cp = MemoryControlPlane::new();
        let clock = Arc::new(ManualClock::default());
        let got = manager(&cp, clock.clone())
            .ensure_model(&model("sha256:aa"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(got, model("sha256:aa"));
        assert_eq!(cp.call_count(Call::DeleteModel).await, 0);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_replace_waits_for_confirmed_absence() {
        let cp = MemoryControlPlane::new().with_deletion_lag(3);
        cp.put_model(&model("sha256:aa")).await;
        let clock = Arc::new(ManualClock::default());

        manager(&cp, clock.clone())
            .ensure_model(&model("sha256:bb"), &CancellationToken::new())
            .await
            .unwrap();

        let journal = cp.journal().await;
        let create = journal.iter().position(|r| r.call == Call::CreateModel).unwrap();
        let confirmed = journal
            .iter()
            .position(|r| r.call == Call::DescribeModel && r.outcome == CallOutcome::NotFound)
            .unwrap();
        assert!(confirmed < create);
        assert_eq!(
            cp.model("m1").await.unwrap().image,
            "registry.local/analyzer@sha256:bb"
        );
        // settle, then three still-present checks
        assert_eq!(clock.sleeps()[0], Duration::from_secs(30));
        assert_eq!(clock.total_slept(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_deletion_timeout_never_creates() {
        let cp = MemoryControlPlane::new().with_deletion_lag(50);
        cp.put_model(&model("sha256:aa")).await;
        let err = manager(&cp, Arc::new(ManualClock::default()))
            .ensure_model(&model("sha256:bb"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::DeletionTimeout { attempts: 10, .. }));
        assert_eq!(cp.call_count(Call::CreateModel).await, 0);
        // 1 initial probe + 10 deletion checks
        assert_eq!(cp.call_count(Call::DescribeModel).await, 11);
    }

    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let cp = MemoryControlPlane::new().with_deletion_lag(1);
        cp.put_model(&model("sha256:aa")).await;
        // another writer is already tearing it down
        cp.delete_model("m1").await.unwrap();
        cp.inject_fault(Call::DeleteModel, RemoteError::not_found(ResourceKind::Model, "m1"))
            .await;

        let got = manager(&cp, Arc::new(ManualClock::default()))
            .ensure_model(&model("sha256:bb"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(got.artifact.uri(), "registry.local/analyzer@sha256:bb");
        assert_eq!(cp.call_count(Call::CreateModel).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_recreate_is_retryable() {
        let cp = MemoryControlPlane::new();
        cp.inject_fault(
            Call::CreateModel,
            RemoteError::conflict(ResourceKind::Model, "m1", "already exists"),
        )
        .await;
        let err = manager(&cp, Arc::new(ManualClock::default()))
            .ensure_model(&model("sha256:aa"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ConcurrentModification { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_recorded_image_mismatch() {
        let cp = MemoryControlPlane::new();
        cp.override_next_model_image("registry.local/analyzer:latest").await;
        let err = manager(&cp, Arc::new(ManualClock::default()))
            .ensure_model(&model("sha256:aa"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ArtifactMismatch { ref actual, .. } if actual.ends_with(":latest")));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cp = MemoryControlPlane::new().with_deletion_lag(50);
        cp.put_model(&model("sha256:aa")).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager(&cp, Arc::new(ManualClock::default()))
            .ensure_model(&model("sha256:bb"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Cancelled));
        assert_eq!(cp.call_count(Call::CreateModel).await, 0);
    }
}
