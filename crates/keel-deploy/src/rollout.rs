use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use keel_common::{Endpoint, EndpointStatus, InstanceSpec, PollingSettings, ServingConfiguration};
use keel_control::{HostingPlatform, RemoteError};

use crate::clock::Clock;
use crate::error::DeployError;
use crate::poll::{poll_until, retry_transient, PollError, PollPolicy, PollStep, RetryPolicy};

pub const DEFAULT_COMMAND_RETRIES: u32 = 3;

/// Issues serving-configuration names that strictly increase within a process.
///
/// Names are `{endpoint}-{YYYYmmdd-HHMMSS}-{mmm}` in UTC. When two requests
/// land in the same millisecond the later one is bumped forward.
#[derive(Debug, Default)]
pub struct ConfigurationNamer {
    last_ms: AtomicI64,
}

impl ConfigurationNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, endpoint: &str, now: DateTime<Utc>) -> String {
        let wanted = now.timestamp_millis();
        let mut prev = self.last_ms.load(Ordering::SeqCst);
        let issued = loop {
            let candidate = wanted.max(prev.saturating_add(1));
            match self
                .last_ms
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break candidate,
                Err(actual) => prev = actual,
            }
        };
        let at = DateTime::<Utc>::from_timestamp_millis(issued).unwrap_or(now);
        format!("{endpoint}-{}", at.format("%Y%m%d-%H%M%S-%3f"))
    }
}

/// Points a long-lived endpoint at a fresh serving configuration.
#[derive(Clone)]
pub struct EndpointRolloutController {
    hosting: Arc<dyn HostingPlatform>,
    clock: Arc<dyn Clock>,
    namer: Arc<ConfigurationNamer>,
    wait: PollPolicy,
    retry: RetryPolicy,
    command_retries: u32,
}

impl EndpointRolloutController {
    pub fn new(hosting: Arc<dyn HostingPlatform>, clock: Arc<dyn Clock>) -> Self {
        Self {
            hosting,
            clock,
            namer: Arc::new(ConfigurationNamer::new()),
            wait: PollPolicy::rollout(&PollingSettings::default()),
            retry: RetryPolicy::default(),
            command_retries: DEFAULT_COMMAND_RETRIES,
        }
    }

    /// Budget for both the pre-command stabilisation wait and the final
    /// wait for `InService`.
    pub fn with_wait_policy(mut self, policy: PollPolicy) -> Self {
        self.wait = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_command_retries(mut self, retries: u32) -> Self {
        self.command_retries = retries.max(1);
        self
    }

    pub fn with_namer(mut self, namer: Arc<ConfigurationNamer>) -> Self {
        self.namer = namer;
        self
    }

    pub async fn rollout(
        &self,
        endpoint: &str,
        model_name: &str,
        spec: &InstanceSpec,
        cancel: &CancellationToken,
    ) -> Result<Endpoint, DeployError> {
        self.require_model(model_name, cancel).await?;

        let config = self
            .create_configuration(endpoint, model_name, spec, cancel)
            .await?;
        tracing::info!(
            endpoint = %endpoint,
            configuration = %config.name,
            model = %model_name,
            instance_type = %config.instance_type,
            instance_count = config.instance_count,
            "serving configuration created"
        );

        let prior = self.apply(endpoint, &config.name, cancel).await?;
        let prior_failure = prior.and_then(|ep| ep.failure_reason);

        let deployed = self
            .await_in_service(endpoint, &config.name, prior_failure.as_deref(), cancel)
            .await?;
        tracing::info!(
            endpoint = %endpoint,
            configuration = %deployed.active_configuration,
            image = deployed.deployed_image.as_deref().unwrap_or("-"),
            "endpoint in service"
        );
        Ok(deployed)
    }

    async fn require_model(&self, model_name: &str, cancel: &CancellationToken) -> Result<(), DeployError> {
        let hosting = &self.hosting;
        match retry_transient(self.clock.as_ref(), &self.retry, cancel, "describe model", move || async move {
            hosting.describe_model(model_name).await
        })
        .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_remote_not_found() => Err(DeployError::ModelMissing(model_name.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn create_configuration(
        &self,
        endpoint: &str,
        model_name: &str,
        spec: &InstanceSpec,
        cancel: &CancellationToken,
    ) -> Result<ServingConfiguration, DeployError> {
        let hosting = &self.hosting;
        for _ in 0..self.command_retries {
            let name = self.namer.next(endpoint, self.clock.now());
            let config = ServingConfiguration::for_model(name, model_name, spec);
            let cfg = &config;
            match retry_transient(
                self.clock.as_ref(),
                &self.retry,
                cancel,
                "create serving configuration",
                move || async move { hosting.create_serving_configuration(cfg).await },
            )
            .await
            {
                Ok(()) => return Ok(config),
                Err(e) if e.is_remote_conflict() => {
                    tracing::warn!(configuration = %config.name, "configuration name taken, generating another");
                }
                Err(e) => return Err(e),
            }
        }
        Err(DeployError::ConcurrentModification {
            resource: format!("serving configurations for '{endpoint}'"),
            detail: format!("{} generated names already taken", self.command_retries),
        })
    }

    /// Issue exactly one successful create or update. Returns the endpoint as
    /// it was before the command (`None` when it had to be created).
    async fn apply(
        &self,
        endpoint: &str,
        configuration: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Endpoint>, DeployError> {
        for attempt in 1..=self.command_retries {
            let current = match self.describe(endpoint, cancel).await? {
                Some(ep) if ep.status.is_transitioning() => {
                    tracing::info!(endpoint = %endpoint, status = %ep.status, "endpoint transitioning, waiting before issuing command");
                    self.await_stable(endpoint, cancel).await?
                }
                other => other,
            };

            let hosting = &self.hosting;
            let outcome = match &current {
                None => {
                    tracing::info!(endpoint = %endpoint, configuration, "creating endpoint");
                    retry_transient(self.clock.as_ref(), &self.retry, cancel, "create endpoint", move || async move {
                        hosting.create_endpoint(endpoint, configuration).await
                    })
                    .await
                }
                Some(ep) if ep.status == EndpointStatus::Deleting => {
                    return Err(DeployError::ConcurrentModification {
                        resource: format!("endpoint '{endpoint}'"),
                        detail: "endpoint is being deleted".into(),
                    });
                }
                Some(ep) => {
                    tracing::info!(
                        endpoint = %endpoint,
                        status = %ep.status,
                        from = %ep.active_configuration,
                        to = configuration,
                        "updating endpoint"
                    );
                    retry_transient(self.clock.as_ref(), &self.retry, cancel, "update endpoint", move || async move {
                        hosting.update_endpoint(endpoint, configuration).await
                    })
                    .await
                }
            };

            match outcome {
                Ok(()) => return Ok(current),
                Err(e) if e.is_remote_conflict() || e.is_remote_not_found() => {
                    tracing::warn!(endpoint = %endpoint, attempt, error = %e, "endpoint changed underneath, re-probing");
                }
                Err(e) => return Err(e),
            }
        }
        Err(DeployError::ConcurrentModification {
            resource: format!("endpoint '{endpoint}'"),
            detail: format!("{} commands rejected as conflicting", self.command_retries),
        })
    }

    async fn describe(&self, endpoint: &str, cancel: &CancellationToken) -> Result<Option<Endpoint>, DeployError> {
        let hosting = &self.hosting;
        match retry_transient(self.clock.as_ref(), &self.retry, cancel, "describe endpoint", move || async move {
            hosting.describe_endpoint(endpoint).await
        })
        .await
        {
            Ok(ep) => Ok(Some(ep)),
            Err(e) if e.is_remote_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn await_stable(&self, endpoint: &str, cancel: &CancellationToken) -> Result<Option<Endpoint>, DeployError> {
        let hosting = &self.hosting;
        let result = poll_until(self.clock.as_ref(), &self.wait, cancel, move |_| async move {
            stable_step(hosting.describe_endpoint(endpoint).await)
        })
        .await;
        finish_wait(endpoint, result)
    }

    async fn await_in_service(
        &self,
        endpoint: &str,
        configuration: &str,
        prior_failure: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Endpoint, DeployError> {
        let hosting = &self.hosting;
        let seen_transition = AtomicBool::new(false);
        let seen = &seen_transition;
        let result = poll_until(self.clock.as_ref(), &self.wait, cancel, move |attempt| async move {
            let describe = hosting.describe_endpoint(endpoint).await;
            if let Ok(ep) = &describe {
                if ep.status.is_transitioning() || ep.active_configuration == configuration {
                    seen.store(true, Ordering::SeqCst);
                }
            }
            let step = in_service_step(
                endpoint,
                configuration,
                prior_failure,
                seen.load(Ordering::SeqCst),
                describe,
            );
            if let Ok(PollStep::Pending(detail)) = &step {
                tracing::info!(endpoint = %endpoint, attempt, %detail, "waiting for InService");
            }
            step
        })
        .await;
        finish_wait(endpoint, result)
    }
}

fn finish_wait<T>(endpoint: &str, result: Result<T, PollError>) -> Result<T, DeployError> {
    result.map_err(|e| match e {
        PollError::Exhausted { attempts, last } => DeployError::RolloutTimeout {
            endpoint: endpoint.to_string(),
            attempts,
            last: last.unwrap_or_else(|| "nothing".into()),
        },
        PollError::Cancelled => DeployError::Cancelled,
        PollError::Aborted(e) => e,
    })
}

/// Ready once the endpoint is out of any transitional status, or gone.
fn stable_step(describe: Result<Endpoint, RemoteError>) -> Result<PollStep<Option<Endpoint>>, DeployError> {
    match describe {
        Ok(ep) if ep.status.is_transitioning() => Ok(PollStep::Pending(ep.status.to_string())),
        Ok(ep) => Ok(PollStep::Ready(Some(ep))),
        Err(e) if e.is_not_found() => Ok(PollStep::Ready(None)),
        Err(e) if e.is_transient() => Ok(PollStep::Pending(format!("describe failed: {e}"))),
        Err(e) => Err(DeployError::remote("describe endpoint", e)),
    }
}

/// Ready once the endpoint serves `configuration`.
///
/// A describe may briefly still show the state from before the command; that
/// is recognised by the old configuration together with an unchanged failure
/// reason and keeps waiting. Once the endpoint has been seen transitioning or
/// on `configuration`, every terminal status is taken at face value.
fn in_service_step(
    endpoint: &str,
    configuration: &str,
    prior_failure: Option<&str>,
    seen_transition: bool,
    describe: Result<Endpoint, RemoteError>,
) -> Result<PollStep<Endpoint>, DeployError> {
    let ep = match describe {
        Ok(ep) => ep,
        Err(e) if e.is_not_found() => return Ok(PollStep::Pending("not visible yet".into())),
        Err(e) if e.is_transient() => return Ok(PollStep::Pending(format!("describe failed: {e}"))),
        Err(e) => return Err(DeployError::remote("describe endpoint", e)),
    };

    let stale = !seen_transition
        && ep.active_configuration != configuration
        && ep.failure_reason.as_deref() == prior_failure;
    let failed = |reason: String| DeployError::RolloutFailed {
        endpoint: endpoint.to_string(),
        reason,
    };

    let status = ep.status;
    match status {
        EndpointStatus::InService if ep.active_configuration == configuration => Ok(PollStep::Ready(ep)),
        EndpointStatus::InService | EndpointStatus::Failed if stale => Ok(PollStep::Pending(format!(
            "{status} on previous configuration {}",
            ep.active_configuration
        ))),
        EndpointStatus::InService => Err(failed(ep.failure_reason.unwrap_or_else(|| {
            format!("rolled back to configuration {}", ep.active_configuration)
        }))),
        EndpointStatus::Failed => Err(failed(
            ep.failure_reason
                .unwrap_or_else(|| "endpoint reported Failed".into()),
        )),
        EndpointStatus::OutOfService | EndpointStatus::Deleting => {
            Err(failed(format!("endpoint went {status}")))
        }
        s => Ok(PollStep::Pending(s.to_string())),
    }
}
