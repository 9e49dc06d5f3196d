use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactReference;

/// A named remote registration binding an artifact to an execution identity.
///
/// The hosting platform cannot repoint an existing model at another image, so
/// a changed artifact always means delete-then-create under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResource {
    /// Unique per account/region scope.
    pub name: String,
    pub artifact: ArtifactReference,
    /// Role/identity the serving container runs as.
    pub execution_identity: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl ModelResource {
    pub fn new(
        name: impl Into<String>,
        artifact: ArtifactReference,
        execution_identity: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            artifact,
            execution_identity: execution_identity.into(),
            environment: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}
