pub mod artifact;
pub mod endpoint;
pub mod environment;
pub mod model;
pub mod serving;
pub mod verification;

pub use artifact::{ArtifactReference, Digest, ReferenceError, Selector, DEFAULT_TAG};
pub use endpoint::{Endpoint, EndpointPhase, EndpointStatus};
pub use environment::{ConfigError, EnvironmentConfig, EnvironmentSettings, KeelConfig, PollingSettings};
pub use model::ModelResource;
pub use serving::{InstanceSpec, ServingConfiguration, ServingTimeouts, DEFAULT_VARIANT};
pub use verification::VerificationResult;

pub mod telemetry;
