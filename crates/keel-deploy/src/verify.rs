use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use keel_common::{
    Digest, Endpoint, EndpointStatus, Selector, VerificationResult, DEFAULT_TAG,
};
use keel_control::HostingPlatform;

use crate::clock::Clock;
use crate::error::DeployError;
use crate::poll::{retry_transient, RetryPolicy};
use crate::resolver::ArtifactResolver;

/// One endpoint to check in [`DriftVerifier::verify_many`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyTarget {
    pub endpoint_name: String,
    pub repository: String,
    pub expected: Option<Digest>,
}

impl VerifyTarget {
    pub fn new(endpoint_name: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            repository: repository.into(),
            expected: None,
        }
    }

    pub fn expecting(mut self, digest: Digest) -> Self {
        self.expected = Some(digest);
        self
    }
}

/// Read-only comparison of the registry's tag against what an endpoint runs.
#[derive(Clone)]
pub struct DriftVerifier {
    resolver: ArtifactResolver,
    hosting: Arc<dyn HostingPlatform>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    tag: String,
}

impl DriftVerifier {
    pub fn new(resolver: ArtifactResolver, hosting: Arc<dyn HostingPlatform>, clock: Arc<dyn Clock>) -> Self {
        Self {
            resolver,
            hosting,
            clock,
            retry: RetryPolicy::default(),
            tag: DEFAULT_TAG.to_string(),
        }
    }

    /// Compare against `tag` instead of `latest`.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn verify(
        &self,
        endpoint_name: &str,
        repository: &str,
        expected: Option<&Digest>,
        cancel: &CancellationToken,
    ) -> Result<VerificationResult, DeployError> {
        let selector = Selector::Tag(self.tag.clone());
        let (registry_digest, deployed_digest) = tokio::try_join!(
            self.resolver.resolve(repository, &selector, cancel),
            self.deployed_digest(endpoint_name, cancel),
        )?;

        let result = VerificationResult::evaluate(
            endpoint_name,
            registry_digest,
            deployed_digest,
            expected.cloned(),
        );
        tracing::info!(
            endpoint = %endpoint_name,
            registry = %result.registry_digest,
            deployed = %result.deployed_digest,
            matched = result.matched,
            "verification complete"
        );
        Ok(result)
    }

    /// Check several endpoints concurrently. Results keep the input order.
    pub async fn verify_many(
        &self,
        targets: &[VerifyTarget],
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<VerificationResult, DeployError>)> {
        let checks = targets.iter().map(|t| async move {
            let result = self
                .verify(&t.endpoint_name, &t.repository, t.expected.as_ref(), cancel)
                .await;
            (t.endpoint_name.clone(), result)
        });
        join_all(checks).await
    }

    async fn deployed_digest(&self, endpoint_name: &str, cancel: &CancellationToken) -> Result<Digest, DeployError> {
        let hosting = &self.hosting;
        let endpoint = retry_transient(self.clock.as_ref(), &self.retry, cancel, "describe endpoint", move || async move {
            hosting.describe_endpoint(endpoint_name).await
        })
        .await?;
        deployed_digest_of(&endpoint)
    }
}

/// Digest the endpoint is actually serving.
fn deployed_digest_of(endpoint: &Endpoint) -> Result<Digest, DeployError> {
    if endpoint.status != EndpointStatus::InService {
        return Err(DeployError::EndpointNotReady {
            endpoint: endpoint.name.clone(),
            reason: format!("status is {}", endpoint.status),
        });
    }
    let image = endpoint
        .deployed_image
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| DeployError::EndpointNotReady {
            endpoint: endpoint.name.clone(),
            reason: "no deployed image reported".into(),
        })?;

    // Only the part after `@` matters; the registry host may be omitted.
    match image.rsplit_once('@') {
        Some((_, digest)) => Ok(Digest::parse(digest)?),
        None => Err(DeployError::NonDeterministicReference {
            endpoint: endpoint.name.clone(),
            reference: image.to_string(),
        }),
    }
}

/// Turns a negative [`VerificationResult`] into an error.
pub trait EnsureMatch {
    fn ensure_match(&self) -> Result<(), DeployError>;
}

impl EnsureMatch for VerificationResult {
    fn ensure_match(&self) -> Result<(), DeployError> {
        if self.matched {
            return Ok(());
        }
        let expected = if self.registry_matches() {
            self.expected_digest.clone().unwrap_or_else(|| self.registry_digest.clone())
        } else {
            self.registry_digest.clone()
        };
        Err(DeployError::DigestMismatch {
            endpoint: self.endpoint_name.clone(),
            expected,
            deployed: self.deployed_digest.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorClass;
    use keel_control::{Call, MemoryControlPlane};

    fn d(s: &str) -> Digest {
        Digest::parse(s).unwrap()
    }

    fn serving(image: Option<&str>, status: EndpointStatus) -> Endpoint {
        Endpoint {
            name: "e1".into(),
            active_configuration: "e1-1".into(),
            status,
            deployed_image: image.map(String::from),
            failure_reason: None,
        }
    }

    fn verifier(cp: &MemoryControlPlane) -> DriftVerifier {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let resolver = ArtifactResolver::new(Arc::new(cp.clone()), clock.clone());
        DriftVerifier::new(resolver, Arc::new(cp.clone()), clock)
    }

    #[test]
    fn test_deployed_digest_of() {
        let ok = serving(Some("registry.local/analyzer@sha256:d1"), EndpointStatus::InService);
        assert_eq!(deployed_digest_of(&ok).unwrap(), d("sha256:d1"));

        let hostless = serving(Some("analyzer@sha256:d1"), EndpointStatus::InService);
        assert_eq!(deployed_digest_of(&hostless).unwrap(), d("sha256:d1"));

        let bare_tag = serving(Some("analyzer:latest"), EndpointStatus::InService);
        assert!(matches!(
            deployed_digest_of(&bare_tag),
            Err(DeployError::NonDeterministicReference { .. })
        ));

        let garbled = serving(Some("analyzer@not-a-digest"), EndpointStatus::InService);
        assert!(matches!(deployed_digest_of(&garbled), Err(DeployError::Reference(_))));

        let tagged = serving(Some("registry.local/analyzer:latest"), EndpointStatus::InService);
        assert!(matches!(
            deployed_digest_of(&tagged),
            Err(DeployError::NonDeterministicReference { .. })
        ));

        let updating = serving(Some("registry.local/analyzer@sha256:d1"), EndpointStatus::Updating);
        assert!(matches!(deployed_digest_of(&updating), Err(DeployError::EndpointNotReady { .. })));

        let empty = serving(None, EndpointStatus::InService);
        assert!(matches!(deployed_digest_of(&empty), Err(DeployError::EndpointNotReady { .. })));
    }

    #[test]
    fn test_ensure_match() {
        let same = VerificationResult::evaluate("e1", d("sha256:d1"), d("sha256:d1"), None);
        assert!(same.ensure_match().is_ok());

        let drift = VerificationResult::evaluate("e1", d("sha256:d2"), d("sha256:d1"), None);
        let err = drift.ensure_match().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Consistency);
        assert!(matches!(err, DeployError::DigestMismatch { ref expected, .. } if *expected == d("sha256:d2")));

        let pinned = VerificationResult::evaluate("e1", d("sha256:d1"), d("sha256:d1"), Some(d("sha256:d3")));
        let err = pinned.ensure_match().unwrap_err();
        assert!(matches!(err, DeployError::DigestMismatch { ref expected, .. } if *expected == d("sha256:d3")));
    }

    #[tokio::test]
    async fn test_verify_match_and_mismatch() {
        let cp = MemoryControlPlane::new();
        cp.put_image("analyzer", "latest", d("sha256:d1")).await;
        cp.put_endpoint(serving(Some("registry.local/analyzer@sha256:d1"), EndpointStatus::InService))
            .await;
        let v = verifier(&cp);
        let cancel = CancellationToken::new();

        let r = v.verify("e1", "analyzer", None, &cancel).await.unwrap();
        assert!(r.matched);

        let r = v.verify("e1", "analyzer", Some(&d("sha256:d2")), &cancel).await.unwrap();
        assert!(!r.matched);
        assert_eq!(r.expected_matches(), Some(false));

        cp.put_image("analyzer", "latest", d("sha256:d2")).await;
        let r = v.verify("e1", "analyzer", None, &cancel).await.unwrap();
        assert!(!r.matched);
        assert!(!r.registry_matches());
    }

    #[tokio::test]
    async fn test_verify_with_tag_override() {
        let cp = MemoryControlPlane::new();
        cp.put_image("analyzer", "latest", d("sha256:d2")).await;
        cp.put_image("analyzer", "stable", d("sha256:d1")).await;
        cp.put_endpoint(serving(Some("registry.local/analyzer@sha256:d1"), EndpointStatus::InService))
            .await;

        let r = verifier(&cp)
            .with_tag("stable")
            .verify("e1", "analyzer", None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(r.matched);
    }

    #[tokio::test]
    async fn test_verify_makes_no_mutations() {
        let cp = MemoryControlPlane::new();
        cp.put_image("analyzer", "latest", d("sha256:d1")).await;
        cp.put_endpoint(serving(Some("registry.local/analyzer:latest"), EndpointStatus::InService))
            .await;

        let err = verifier(&cp)
            .verify("e1", "analyzer", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::NonDeterministicReference { .. }));
        for record in cp.journal().await {
            assert!(matches!(record.call, Call::DescribeImage | Call::DescribeEndpoint));
        }
    }

    #[tokio::test]
    async fn test_verify_many_keeps_order() {
        let cp = MemoryControlPlane::new();
        cp.put_image("analyzer", "latest", d("sha256:d1")).await;
        cp.put_endpoint(serving(Some("registry.local/analyzer@sha256:d1"), EndpointStatus::InService))
            .await;

        let targets = vec![
            VerifyTarget::new("e1", "analyzer"),
            VerifyTarget::new("missing", "analyzer"),
            VerifyTarget::new("e1", "analyzer").expecting(d("sha256:d9")),
        ];
        let results = verifier(&cp).verify_many(&targets, &CancellationToken::new()).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "e1");
        assert!(results[0].1.as_ref().unwrap().matched);
        assert_eq!(results[1].1.as_ref().unwrap_err().class(), ErrorClass::NotFound);
        assert!(!results[2].1.as_ref().unwrap().matched);
    }
}
