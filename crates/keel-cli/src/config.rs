use std::path::Path;

use anyhow::{bail, Context, Result};

use keel_common::{Digest, EnvironmentConfig, KeelConfig};

/// Load the config file. A missing file is only an error once a command needs
/// an environment from it.
pub fn load(path: &Path) -> Result<KeelConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using empty configuration");
        return Ok(KeelConfig::default());
    }
    KeelConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

pub fn environment(
    config: &KeelConfig,
    path: &Path,
    env: &str,
    repository: Option<String>,
    model_name: Option<String>,
    endpoint_name: Option<String>,
) -> Result<EnvironmentConfig> {
    let mut resolved = config
        .resolve(env)
        .with_context(|| format!("resolving environment from {}", path.display()))?;
    if let Some(r) = repository {
        resolved = resolved.with_repository(r);
    }
    if let Some(m) = model_name {
        resolved = resolved.with_model_name(m);
    }
    if let Some(e) = endpoint_name {
        resolved = resolved.with_endpoint_name(e);
    }
    Ok(resolved)
}

/// The flag wins over the file.
pub fn control_plane_url(flag: Option<&str>, config: &KeelConfig) -> Result<String> {
    match flag
        .filter(|u| !u.trim().is_empty())
        .or(config.control_plane.url.as_deref())
    {
        Some(url) => Ok(url.to_string()),
        None => bail!("no control plane URL: pass --control-plane-url or set [control_plane].url"),
    }
}

pub fn digest(raw: Option<&str>) -> Result<Option<Digest>> {
    raw.map(|d| Digest::parse(d).with_context(|| format!("invalid digest '{d}'")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[control_plane]
url = "http://cp.local"

[environments.dev]
registry = "registry.local"
repository = "analyzer"
execution_role = "role"
model_name = "m1"
endpoint_name = "e1"
"#;

    #[test]
    fn test_overrides_apply() {
        let cfg = KeelConfig::from_toml_str(SAMPLE).unwrap();
        let env = environment(
            &cfg,
            Path::new("keel.toml"),
            "dev",
            Some("other-repo".into()),
            None,
            Some("e2".into()),
        )
        .unwrap();
        assert_eq!(env.repository, "other-repo");
        assert_eq!(env.model_name, "m1");
        assert_eq!(env.endpoint_name, "e2");
    }

    #[test]
    fn test_control_plane_url_precedence() {
        let cfg = KeelConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(control_plane_url(None, &cfg).unwrap(), "http://cp.local");
        assert_eq!(control_plane_url(Some("http://flag"), &cfg).unwrap(), "http://flag");
        assert!(control_plane_url(None, &KeelConfig::default()).is_err());
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let cfg = load(Path::new("/nonexistent/keel.toml")).unwrap();
        assert!(cfg.environment_names().is_empty());
    }

    #[test]
    fn test_digest_parsing() {
        assert!(digest(None).unwrap().is_none());
        assert!(digest(Some("sha256:ab")).unwrap().is_some());
        assert!(digest(Some("latest")).is_err());
    }
}
