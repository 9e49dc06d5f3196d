//! Deployment engine: resolve an artifact, replace the model that references
//! it, roll an endpoint onto a fresh serving configuration and verify what the
//! endpoint actually runs.
//!
//! Nothing here prints; every operation returns typed results and logs
//! through `tracing`.

pub mod clock;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod poll;
pub mod resolver;
pub mod rollout;
pub mod verify;

pub use clock::{Clock, ManualClock, TokioClock};
pub use error::{DeployError, ErrorClass};
pub use lifecycle::ModelLifecycleManager;
pub use pipeline::{desired_model, Deployer, PipelineReport, Stage, StageError, FORCE_REFRESH_VAR};
pub use poll::{poll_until, retry_transient, PollError, PollPolicy, PollStep, RetryPolicy};
pub use resolver::ArtifactResolver;
pub use rollout::{ConfigurationNamer, EndpointRolloutController, DEFAULT_COMMAND_RETRIES};
pub use verify::{DriftVerifier, EnsureMatch, VerifyTarget};
