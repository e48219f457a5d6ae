//! Application manifest (`smg.toml`) in the working copy.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{AppIdentity, BuildRule};

/// File name looked up in the working copy.
pub const MANIFEST_FILE: &str = "smg.toml";

/// Declared application and its build rules keyed by branch pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    /// Prebuilt image used instead of a local build in run mode.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub build: BTreeMap<String, BuildRule>,
}

impl Manifest {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("name must be a non-empty string"));
        }
        for (key, rule) in &self.build {
            if key.is_empty() {
                return Err(anyhow!("build rule keys can't be empty"));
            }
            if rule.deploy.iter().any(|channel| channel.trim().is_empty()) {
                return Err(anyhow!("build.\"{key}\".deploy has an empty channel"));
            }
        }
        Ok(())
    }

    pub fn identity(&self) -> AppIdentity {
        AppIdentity {
            name: self.name.trim().to_string(),
            image: self.image.clone(),
        }
    }
}

pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let manifest: Manifest =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    manifest
        .validate()
        .with_context(|| format!("invalid manifest {}", path.display()))?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rules_in_key_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(MANIFEST_FILE);
        fs::write(
            &path,
            r#"
name = "api"

[build.master]
push = true
deploy = ["web"]

[build."feature/.*"]
onlyif = "test -f Dockerfile"

[build.default]
dockerfile = "Dockerfile.dev"
"#,
        )
        .expect("write");
        let manifest = load_manifest(&path).expect("load");
        let keys: Vec<&str> = manifest.build.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["default", "feature/.*", "master"]);
        assert!(manifest.build["master"].push);
        assert_eq!(manifest.build["master"].deploy, vec!["web"]);
        assert!(!manifest.build["feature/.*"].push);
        assert_eq!(manifest.identity().image, None);
    }

    #[test]
    fn rejects_missing_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(MANIFEST_FILE);
        fs::write(&path, "name = \" \"\n").expect("write");
        assert!(load_manifest(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_manifest(&temp.path().join(MANIFEST_FILE)).unwrap_err();
        assert!(format!("{err:#}").contains("read"));
    }
}
