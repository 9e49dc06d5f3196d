use serde::{Deserialize, Serialize};

/// Variant name used when the configuration routes all traffic to one model.
pub const DEFAULT_VARIANT: &str = "AllTraffic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServingTimeouts {
    #[serde(default = "default_timeout_secs")]
    pub model_data_download_secs: u32,
    #[serde(default = "default_timeout_secs")]
    pub container_startup_health_check_secs: u32,
}

impl Default for ServingTimeouts {
    fn default() -> Self {
        Self {
            model_data_download_secs: default_timeout_secs(),
            container_startup_health_check_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u32 {
    3600
}

/// How many of which instance to host a model on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance_type: String,
    pub instance_count: u32,
    #[serde(default)]
    pub timeouts: ServingTimeouts,
    #[serde(default = "default_variant")]
    pub variant_name: String,
}

impl InstanceSpec {
    pub fn new(instance_type: impl Into<String>, instance_count: u32) -> Self {
        Self {
            instance_type: instance_type.into(),
            instance_count,
            timeouts: ServingTimeouts::default(),
            variant_name: default_variant(),
        }
    }
}

fn default_variant() -> String {
    DEFAULT_VARIANT.to_string()
}

/// Immutable, versioned hosting description. Never updated, never deleted;
/// each rollout appends a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServingConfiguration {
    /// `{endpoint}-{YYYYmmdd-HHMMSS}-{mmm}`, unique per endpoint.
    pub name: String,
    pub model_name: String,
    pub variant_name: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub timeouts: ServingTimeouts,
}

impl ServingConfiguration {
    pub fn for_model(name: impl Into<String>, model_name: impl Into<String>, spec: &InstanceSpec) -> Self {
        Self {
            name: name.into(),
            model_name: model_name.into(),
            variant_name: spec.variant_name.clone(),
            instance_type: spec.instance_type.clone(),
            instance_count: spec.instance_count,
            timeouts: spec.timeouts,
        }
    }
}
