//! File-system model registry
//!
//! Layout: `{root}/{name}/registry.json` holds versions and aliases, and
//! every version's artifact is copied to `{root}/{name}/{version}/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::error::{IntelligenceError, Result};

const INDEX_FILE: &str = "registry.json";

/// One registered model version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: u32,
    pub run_id: Uuid,
    pub source: PathBuf,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryIndex {
    versions: Vec<ModelVersion>,
    aliases: BTreeMap<String, u32>,
}

/// Registry rooted at a directory
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read_index(&self, name: &str) -> Result<RegistryIndex> {
        let path = self.model_dir(name).join(INDEX_FILE);
        if !path.exists() {
            return Ok(RegistryIndex::default());
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    fn write_index(&self, name: &str, index: &RegistryIndex) -> Result<()> {
        let dir = self.model_dir(name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(INDEX_FILE), serde_json::to_string_pretty(index)?)?;
        Ok(())
    }

    /// Copy `artifact_dir` in as the next version of `name`
    pub fn register(&self, name: &str, artifact_dir: &Path) -> Result<ModelVersion> {
        if !artifact_dir.is_dir() {
            return Err(IntelligenceError::registry(format!(
                "artifact directory not found: {}",
                artifact_dir.display()
            )));
        }

        let mut index = self.read_index(name)?;
        let version = index.versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        copy_dir(artifact_dir, &self.model_dir(name).join(version.to_string()))?;

        let entry = ModelVersion {
            version,
            run_id: Uuid::new_v4(),
            source: artifact_dir.to_path_buf(),
            registered_at: Utc::now(),
        };
        index.versions.push(entry.clone());
        self.write_index(name, &index)?;

        info!(model = name, version = version, run_id = %entry.run_id, "Model version registered");
        Ok(entry)
    }

    /// Point `alias` at an existing version
    pub fn set_alias(&self, name: &str, alias: &str, version: u32) -> Result<()> {
        let mut index = self.read_index(name)?;
        if !index.versions.iter().any(|v| v.version == version) {
            return Err(IntelligenceError::registry(format!(
                "{} has no version {}",
                name, version
            )));
        }
        index.aliases.insert(alias.to_string(), version);
        self.write_index(name, &index)?;
        info!(model = name, alias = alias, version = version, "Alias updated");
        Ok(())
    }

    /// Artifact directory for an alias or a version number
    pub fn resolve(&self, name: &str, reference: &str) -> Result<PathBuf> {
        let index = self.read_index(name)?;
        let version = match index.aliases.get(reference) {
            Some(version) => *version,
            None => reference
                .parse::<u32>()
                .ok()
                .filter(|v| index.versions.iter().any(|entry| entry.version == *v))
                .ok_or_else(|| {
                    IntelligenceError::registry(format!("{} has no alias or version {}", name, reference))
                })?,
        };
        Ok(self.model_dir(name).join(version.to_string()))
    }

    /// Registered versions, oldest first
    pub fn list_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let mut versions = self.read_index(name)?.versions;
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
