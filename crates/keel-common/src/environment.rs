use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::{ArtifactReference, Selector};
use crate::serving::{InstanceSpec, ServingTimeouts, DEFAULT_VARIANT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown environment '{name}', available: {available}")]
    UnknownEnvironment { name: String, available: String },
    #[error("environment '{env}': {reason}")]
    Invalid { env: String, reason: String },
}

/// Top-level `keel.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeelConfig {
    #[serde(default)]
    pub control_plane: ControlPlaneSettings,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlPlaneSettings {
    /// Base URL of the control-plane API. The CLI flag/env var takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One `[environments.<name>]` table as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSettings {
    pub registry: String,
    pub repository: String,
    pub execution_role: String,
    pub model_name: String,
    pub endpoint_name: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default = "default_instance_count")]
    pub instance_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_name: Option<String>,
    /// Inject `FORCE_REFRESH=<unix seconds>` into the model environment on every deploy.
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub model_environment: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: ServingTimeouts,
    #[serde(default)]
    pub polling: PollingSettings,
}

fn default_instance_type() -> String {
    "ml.c5.large".to_string()
}

fn default_instance_count() -> u32 {
    1
}

/// Poll budgets, in seconds and attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub deletion_settle_secs: u64,
    pub deletion_interval_secs: u64,
    pub deletion_attempts: u32,
    pub rollout_interval_secs: u64,
    pub rollout_attempts: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            deletion_settle_secs: 30,
            deletion_interval_secs: 10,
            deletion_attempts: 10,
            rollout_interval_secs: 30,
            rollout_attempts: 120,
        }
    }
}

/// Fully resolved settings for one deployment target.
///
/// Built once at the CLI boundary and passed by value into the engine, which
/// only ever reads its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentConfig {
    /// Label for logs only.
    pub name: String,
    pub registry: String,
    pub repository: String,
    pub execution_role: String,
    pub model_name: String,
    pub endpoint_name: String,
    pub instance: InstanceSpec,
    pub force_refresh: bool,
    pub model_environment: BTreeMap<String, String>,
    pub polling: PollingSettings,
}

impl EnvironmentConfig {
    /// Reference into this environment's repository with the given selector.
    pub fn artifact(&self, selector: Selector) -> ArtifactReference {
        ArtifactReference::new(self.registry.clone(), self.repository.clone(), selector)
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_endpoint_name(mut self, endpoint_name: impl Into<String>) -> Self {
        self.endpoint_name = endpoint_name.into();
        self
    }
}

impl KeelConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn environment_names(&self) -> Vec<&str> {
        self.environments.keys().map(String::as_str).collect()
    }

    pub fn resolve(&self, env: &str) -> Result<EnvironmentConfig, ConfigError> {
        let settings = self
            .environments
            .get(env)
            .ok_or_else(|| ConfigError::UnknownEnvironment {
                name: env.to_string(),
                available: self.environment_names().join(", "),
            })?;
        settings.validate(env)?;

        let instance = InstanceSpec {
            instance_type: settings.instance_type.clone(),
            instance_count: settings.instance_count,
            timeouts: settings.timeouts,
            variant_name: settings
                .variant_name
                .clone()
                .unwrap_or_else(|| DEFAULT_VARIANT.to_string()),
        };

        Ok(EnvironmentConfig {
            name: env.to_string(),
            registry: settings.registry.clone(),
            repository: settings.repository.clone(),
            execution_role: settings.execution_role.clone(),
            model_name: settings.model_name.clone(),
            endpoint_name: settings.endpoint_name.clone(),
            instance,
            force_refresh: settings.force_refresh,
            model_environment: settings.model_environment.clone(),
            polling: settings.polling,
        })
    }
}

impl EnvironmentSettings {
    fn validate(&self, env: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            env: env.to_string(),
            reason: reason.to_string(),
        };

        let required = [
            ("registry", &self.registry),
            ("repository", &self.repository),
            ("execution_role", &self.execution_role),
            ("model_name", &self.model_name),
            ("endpoint_name", &self.endpoint_name),
            ("instance_type", &self.instance_type),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(invalid(&format!("{field} must not be empty")));
            }
        }
        if self.instance_count == 0 {
            return Err(invalid("instance_count must be at least 1"));
        }
        if self.polling.deletion_attempts == 0 || self.polling.rollout_attempts == 0 {
            return Err(invalid("poll attempts must be at least 1"));
        }
        Ok(())
    }
}
