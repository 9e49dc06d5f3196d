use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use keel_common::{
    ArtifactReference, Digest, Endpoint, EnvironmentConfig, ModelResource, Selector, VerificationResult,
};
use keel_control::{HostingPlatform, Registry};

use crate::clock::Clock;
use crate::error::DeployError;
use crate::lifecycle::ModelLifecycleManager;
use crate::poll::PollPolicy;
use crate::resolver::ArtifactResolver;
use crate::rollout::EndpointRolloutController;
use crate::verify::{DriftVerifier, EnsureMatch};

pub const FORCE_REFRESH_VAR: &str = "FORCE_REFRESH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolve,
    EnsureModel,
    Rollout,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Resolve => "resolve",
            Stage::EnsureModel => "ensure-model",
            Stage::Rollout => "rollout",
            Stage::Verify => "verify",
        })
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: DeployError,
}

impl StageError {
    fn at(stage: Stage) -> impl FnOnce(DeployError) -> StageError {
        move |source| StageError { stage, source }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub environment: String,
    pub artifact: ArtifactReference,
    pub model: ModelResource,
    pub endpoint: Endpoint,
    pub verification: VerificationResult,
}

/// The model an environment should run, pinned to `artifact`.
pub fn desired_model(env: &EnvironmentConfig, artifact: ArtifactReference, now: DateTime<Utc>) -> ModelResource {
    let mut model = ModelResource::new(env.model_name.clone(), artifact, env.execution_role.clone());
    model.environment = env.model_environment.clone();
    if env.force_refresh {
        model
            .environment
            .insert(FORCE_REFRESH_VAR.to_string(), now.timestamp().to_string());
    }
    model
}

/// All four components wired against one environment's polling budgets.
#[derive(Clone)]
pub struct Deployer {
    resolver: ArtifactResolver,
    lifecycle: ModelLifecycleManager,
    rollout: EndpointRolloutController,
    verifier: DriftVerifier,
    clock: Arc<dyn Clock>,
}

impl Deployer {
    pub fn new(
        registry: Arc<dyn Registry>,
        hosting: Arc<dyn HostingPlatform>,
        clock: Arc<dyn Clock>,
        env: &EnvironmentConfig,
    ) -> Self {
        let resolver = ArtifactResolver::new(registry, clock.clone());
        let lifecycle = ModelLifecycleManager::new(hosting.clone(), clock.clone())
            .with_deletion_policy(PollPolicy::deletion(&env.polling));
        let rollout = EndpointRolloutController::new(hosting.clone(), clock.clone())
            .with_wait_policy(PollPolicy::rollout(&env.polling));
        let verifier = DriftVerifier::new(resolver.clone(), hosting, clock.clone());
        Self {
            resolver,
            lifecycle,
            rollout,
            verifier,
            clock,
        }
    }

    /// Resolve `digest` (or the `latest` tag) and make the environment's
    /// model reference it.
    pub async fn deploy_model(
        &self,
        env: &EnvironmentConfig,
        digest: Option<Digest>,
        cancel: &CancellationToken,
    ) -> Result<ModelResource, StageError> {
        let artifact = self.resolve(env, digest, cancel).await?;
        self.ensure_model(env, artifact, cancel).await
    }

    pub async fn rollout_endpoint(
        &self,
        env: &EnvironmentConfig,
        cancel: &CancellationToken,
    ) -> Result<Endpoint, StageError> {
        self.rollout
            .rollout(&env.endpoint_name, &env.model_name, &env.instance, cancel)
            .await
            .map_err(StageError::at(Stage::Rollout))
    }

    /// Every stage in order, stopping at the first failure.
    ///
    /// With an explicit digest the final check only requires the endpoint to
    /// run that digest; otherwise it must also equal the registry's `latest`.
    pub async fn run(
        &self,
        env: &EnvironmentConfig,
        digest: Option<Digest>,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, StageError> {
        let span = tracing::info_span!("pipeline", environment = %env.name);
        self.run_stages(env, digest, cancel).instrument(span).await
    }

    async fn run_stages(
        &self,
        env: &EnvironmentConfig,
        digest: Option<Digest>,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, StageError> {
        let explicit = digest.is_some();
        let artifact = self.resolve(env, digest, cancel).await?;
        let model = self.ensure_model(env, artifact.clone(), cancel).await?;
        let endpoint = self.rollout_endpoint(env, cancel).await?;

        let pinned = artifact.digest().cloned();
        let verification = self
            .verifier
            .verify(&env.endpoint_name, &env.repository, pinned.as_ref(), cancel)
            .await
            .map_err(StageError::at(Stage::Verify))?;
        let verdict = if explicit {
            match verification.expected_matches() {
                Some(false) => verification.ensure_match(),
                _ => Ok(()),
            }
        } else {
            verification.ensure_match()
        };
        verdict.map_err(StageError::at(Stage::Verify))?;

        Ok(PipelineReport {
            environment: env.name.clone(),
            artifact,
            model,
            endpoint,
            verification,
        })
    }

    async fn resolve(
        &self,
        env: &EnvironmentConfig,
        digest: Option<Digest>,
        cancel: &CancellationToken,
    ) -> Result<ArtifactReference, StageError> {
        let selector = digest.map_or_else(Selector::latest, Selector::Digest);
        self.resolver
            .resolve_reference(&env.artifact(selector), cancel)
            .await
            .map_err(StageError::at(Stage::Resolve))
    }

    async fn ensure_model(
        &self,
        env: &EnvironmentConfig,
        artifact: ArtifactReference,
        cancel: &CancellationToken,
    ) -> Result<ModelResource, StageError> {
        let desired = desired_model(env, artifact, self.clock.now());
        self.lifecycle
            .ensure_model(&desired, cancel)
            .await
            .map_err(StageError::at(Stage::EnsureModel))
    }
}
