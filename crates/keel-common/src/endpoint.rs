use serde::{Deserialize, Serialize};

/// Status as reported by the hosting platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EndpointStatus {
    Creating,
    Updating,
    SystemUpdating,
    RollingBack,
    InService,
    OutOfService,
    Deleting,
    Failed,
}

/// Coarse phase of an endpoint, the only thing the rollout state machine branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPhase {
    /// A platform-side operation is in flight; commands will be rejected.
    Transitioning,
    /// Accepts an update command.
    Stable,
    /// Cannot serve and will not recover without intervention.
    Broken,
}

impl EndpointStatus {
    pub fn phase(self) -> EndpointPhase {
        match self {
            EndpointStatus::Creating
            | EndpointStatus::Updating
            | EndpointStatus::SystemUpdating
            | EndpointStatus::RollingBack => EndpointPhase::Transitioning,
            EndpointStatus::InService | EndpointStatus::Failed => EndpointPhase::Stable,
            EndpointStatus::OutOfService | EndpointStatus::Deleting => EndpointPhase::Broken,
        }
    }

    pub fn is_transitioning(self) -> bool {
        self.phase() == EndpointPhase::Transitioning
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointStatus::Creating => "Creating",
            EndpointStatus::Updating => "Updating",
            EndpointStatus::SystemUpdating => "SystemUpdating",
            EndpointStatus::RollingBack => "RollingBack",
            EndpointStatus::InService => "InService",
            EndpointStatus::OutOfService => "OutOfService",
            EndpointStatus::Deleting => "Deleting",
            EndpointStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The long-lived named serving target.
///
/// Points at exactly one serving configuration at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub active_configuration: String,
    pub status: EndpointStatus,

    /// Image the platform actually resolved and runs, e.g. `host/repo@sha256:...`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_mapping() {
        assert_eq!(EndpointStatus::Creating.phase(), EndpointPhase::Transitioning);
        assert_eq!(EndpointStatus::Updating.phase(), EndpointPhase::Transitioning);
        assert_eq!(EndpointStatus::InService.phase(), EndpointPhase::Stable);
        assert_eq!(EndpointStatus::Failed.phase(), EndpointPhase::Stable);
        assert_eq!(EndpointStatus::OutOfService.phase(), EndpointPhase::Broken);
    }

    #[test]
    fn test_status_wire_names() {
        let s = serde_json::to_string(&EndpointStatus::InService).unwrap();
        assert_eq!(s, "\"InService\"");
        let back: EndpointStatus = serde_json::from_str("\"RollingBack\"").unwrap();
        assert_eq!(back, EndpointStatus::RollingBack);
    }
}
