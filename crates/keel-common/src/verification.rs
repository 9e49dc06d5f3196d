use serde::{Deserialize, Serialize};

use crate::artifact::Digest;

/// Outcome of a drift check. Advisory only; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub endpoint_name: String,
    /// Digest the registry currently carries for the checked tag.
    pub registry_digest: Digest,
    pub deployed_digest: Digest,
    /// Caller-supplied pin, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<Digest>,
    #[serde(rename = "match")]
    pub matched: bool,
}

impl VerificationResult {
    pub fn evaluate(
        endpoint_name: impl Into<String>,
        registry_digest: Digest,
        deployed_digest: Digest,
        expected_digest: Option<Digest>,
    ) -> Self {
        let matched = registry_digest == deployed_digest
            && expected_digest.as_ref().is_none_or(|e| *e == deployed_digest);
        Self {
            endpoint_name: endpoint_name.into(),
            registry_digest,
            deployed_digest,
            expected_digest,
            matched,
        }
    }

    pub fn registry_matches(&self) -> bool {
        self.registry_digest == self.deployed_digest
    }

    /// `None` when no pin was supplied.
    pub fn expected_matches(&self) -> Option<bool> {
        self.expected_digest.as_ref().map(|e| *e == self.deployed_digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Digest {
        Digest::parse(s).unwrap()
    }

    #[test]
    fn test_match_without_pin() {
        let r = VerificationResult::evaluate("e1", d("sha256:01"), d("sha256:01"), None);
        assert!(r.matched);
        assert_eq!(r.expected_matches(), None);
    }

    #[test]
    fn test_mismatch_against_registry() {
        let r = VerificationResult::evaluate("e1", d("sha256:01"), d("sha256:02"), None);
        assert!(!r.matched);
        assert!(!r.registry_matches());
    }

    #[test]
    fn test_pin_must_also_match() {
        let r = VerificationResult::evaluate("e1", d("sha256:01"), d("sha256:01"), Some(d("sha256:03")));
        assert!(!r.matched);
        assert!(r.registry_matches());
        assert_eq!(r.expected_matches(), Some(false));
    }

    #[test]
    fn test_serializes_match_field() {
        let r = VerificationResult::evaluate("e1", d("sha256:01"), d("sha256:01"), None);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["match"], serde_json::json!(true));
    }
}
