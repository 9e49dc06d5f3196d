use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag used when an image URI carries neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

const DIGEST_ALGORITHM: &str = "sha256";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,
    #[error("image reference '{0}' has no repository")]
    MissingRepository(String),
    #[error("invalid digest '{0}': expected sha256:<lowercase hex>")]
    InvalidDigest(String),
    #[error("invalid tag '{0}'")]
    InvalidTag(String),
}

/// Immutable content identifier of an artifact, e.g. `sha256:9f86d0...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let raw = raw.trim();
        let Some((algorithm, hex)) = raw.split_once(':') else {
            return Err(ReferenceError::InvalidDigest(raw.to_string()));
        };
        let hex_ok = !hex.is_empty()
            && hex
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if algorithm != DIGEST_ALGORITHM || !hex_ok {
            return Err(ReferenceError::InvalidDigest(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a selector string is written in digest form.
    pub fn looks_like_digest(raw: &str) -> bool {
        raw.trim().starts_with("sha256:")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// Either a mutable tag or an immutable digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    Tag(String),
    Digest(Digest),
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let raw = raw.trim();
        if Digest::looks_like_digest(raw) {
            return Digest::parse(raw).map(Selector::Digest);
        }
        if raw.is_empty() || raw.contains(['/', '@', ':']) || raw.contains(char::is_whitespace) {
            return Err(ReferenceError::InvalidTag(raw.to_string()));
        }
        Ok(Selector::Tag(raw.to_string()))
    }

    pub fn latest() -> Self {
        Selector::Tag(DEFAULT_TAG.to_string())
    }

    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Selector::Digest(d) => Some(d),
            Selector::Tag(_) => None,
        }
    }

    pub fn is_digest(&self) -> bool {
        matches!(self, Selector::Digest(_))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Tag(t) => f.write_str(t),
            Selector::Digest(d) => f.write_str(d.as_str()),
        }
    }
}

/// Points at a container image in a registry.
///
/// A digest-form reference is stable forever; a tag-form reference may be
/// repointed by the registry at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Registry host, possibly with a port (e.g. `123456789012.dkr.ecr.us-east-1.amazonaws.com`).
    pub registry: String,
    pub repository: String,
    pub selector: Selector,
}

impl ArtifactReference {
    pub fn new(registry: impl Into<String>, repository: impl Into<String>, selector: Selector) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            selector,
        }
    }

    /// Parse an image URI such as `host/repo:tag` or `host/repo@sha256:...`.
    ///
    /// The tag separator is the last `:` after the last `/`, so registry ports
    /// (`host:5000/repo`) are not mistaken for tags.
    pub fn parse(uri: &str) -> Result<Self, ReferenceError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (name, selector) = if let Some((name, digest)) = uri.split_once('@') {
            (name, Selector::Digest(Digest::parse(digest)?))
        } else {
            let last_slash = uri.rfind('/').unwrap_or(0);
            match uri.rfind(':') {
                Some(pos) if pos > last_slash => (&uri[..pos], Selector::parse(&uri[pos + 1..])?),
                _ => (uri, Selector::latest()),
            }
        };

        let Some((registry, repository)) = name.split_once('/') else {
            return Err(ReferenceError::MissingRepository(uri.to_string()));
        };
        if registry.is_empty() || repository.is_empty() {
            return Err(ReferenceError::MissingRepository(uri.to_string()));
        }

        Ok(Self::new(registry, repository, selector))
    }

    /// Same image location, pinned to `digest`.
    pub fn pinned(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            selector: Selector::Digest(digest),
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.selector.digest()
    }

    pub fn is_pinned(&self) -> bool {
        self.selector.is_digest()
    }

    pub fn uri(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            Selector::Tag(t) => write!(f, "{}/{}:{}", self.registry, self.repository, t),
            Selector::Digest(d) => write!(f, "{}/{}@{}", self.registry, self.repository, d),
        }
    }
}

impl FromStr for ArtifactReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_digest_reference() {
        let r = ArtifactReference::parse("123.dkr.ecr.us-east-1.amazonaws.com/analyzer@sha256:abc123").unwrap();
        assert_eq!(r.registry, "123.dkr.ecr.us-east-1.amazonaws.com");
        assert_eq!(r.repository, "analyzer");
        assert_eq!(r.digest().map(|d| d.as_str()), Some("sha256:abc123"));
        assert!(r.is_pinned());
    }

    #[test]
    fn test_parse_tag_reference_with_port() {
        let r = ArtifactReference::parse("registry.local:5000/team/analyzer:v2").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "team/analyzer");
        assert_eq!(r.selector, Selector::Tag("v2".to_string()));
    }

    #[test]
    fn test_parse_defaults_to_latest() {
        let r = ArtifactReference::parse("registry.local:5000/analyzer").unwrap();
        assert_eq!(r.selector, Selector::latest());
        assert_eq!(r.to_string(), "registry.local:5000/analyzer:latest");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(ArtifactReference::parse("  "), Err(ReferenceError::Empty));
        assert!(matches!(
            ArtifactReference::parse("analyzer:latest"),
            Err(ReferenceError::MissingRepository(_))
        ));
        assert!(matches!(
            ArtifactReference::parse("host/analyzer@md5:abc"),
            Err(ReferenceError::InvalidDigest(_))
        ));
        assert!(matches!(
            ArtifactReference::parse("host/analyzer@sha256:XYZ"),
            Err(ReferenceError::InvalidDigest(_))
        ));
    }

    #[test]
    fn test_display_roundtrips_uri() {
        let uri = "host/analyzer@sha256:0123456789abcdef";
        assert_eq!(ArtifactReference::parse(uri).unwrap().uri(), uri);
    }

    #[test]
    fn test_pinned_keeps_location() {
        let tagged = ArtifactReference::parse("host/analyzer:latest").unwrap();
        let pinned = tagged.pinned(Digest::parse("sha256:beef").unwrap());
        assert_eq!(pinned.to_string(), "host/analyzer@sha256:beef");
        assert!(!tagged.is_pinned());
    }

    #[test]
    fn test_selector_parse() {
        assert!(Selector::parse("sha256:aaa").unwrap().is_digest());
        assert_eq!(Selector::parse("latest").unwrap(), Selector::latest());
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("a/b").is_err());
    }

    #[test]
    fn test_digest_serde() {
        let d: Digest = serde_json::from_str("\"sha256:ff00\"").unwrap();
        assert_eq!(d.as_str(), "sha256:ff00");
        assert!(serde_json::from_str::<Digest>("\"nope\"").is_err());
    }
}
