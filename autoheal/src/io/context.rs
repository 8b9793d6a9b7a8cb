//! Per-feature context bundles (`.autoheal/context/<feature>/`).
//!
//! A bundle exists when every required artifact (`<name>.md`) is present and
//! non-empty. Nothing else in the directory (worker log, build result) matters.

use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::io::paths::{AutohealPaths, validate_id};

/// Cached research output for a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBundle {
    pub feature: String,
    pub path: PathBuf,
    pub artifact_names: Vec<String>,
    /// Modification time of the newest artifact.
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ContextCache {
    paths: AutohealPaths,
    required: Vec<String>,
}

impl ContextCache {
    pub fn new(paths: AutohealPaths, required: Vec<String>) -> Self {
        Self { paths, required }
    }

    pub fn required_artifacts(&self) -> &[String] {
        &self.required
    }

    pub fn dir(&self, feature: &str) -> PathBuf {
        self.paths.bundle_dir(feature)
    }

    pub fn artifact_path(&self, feature: &str, name: &str) -> PathBuf {
        self.dir(feature).join(format!("{name}.md"))
    }

    /// Required artifacts that are missing or empty.
    pub fn missing_artifacts(&self, feature: &str) -> Result<Vec<String>> {
        validate_id("feature", feature)?;
        let mut missing = Vec::new();
        for name in &self.required {
            let path = self.artifact_path(feature, name);
            let present = match fs::metadata(&path) {
                Ok(meta) => meta.is_file() && meta.len() > 0,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
                Err(err) => {
                    return Err(err).with_context(|| format!("stat {}", path.display()));
                }
            };
            if !present {
                missing.push(name.clone());
            }
        }
        Ok(missing)
    }

    pub fn exists(&self, feature: &str) -> Result<bool> {
        Ok(self.missing_artifacts(feature)?.is_empty())
    }

    /// Descriptor of a complete bundle, or `None`.
    pub fn bundle(&self, feature: &str) -> Result<Option<ContextBundle>> {
        if !self.exists(feature)? {
            return Ok(None);
        }
        let mut newest = SystemTime::UNIX_EPOCH;
        for name in &self.required {
            let path = self.artifact_path(feature, name);
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .with_context(|| format!("stat {}", path.display()))?;
            newest = newest.max(modified);
        }
        Ok(Some(ContextBundle {
            feature: feature.to_string(),
            path: self.dir(feature),
            artifact_names: self.required.clone(),
            built_at: DateTime::<Utc>::from(newest),
        }))
    }

    /// Remove the required artifacts so a forced rebuild starts clean.
    pub fn clear_artifacts(&self, feature: &str) -> Result<()> {
        validate_id("feature", feature)?;
        for name in &self.required {
            let path = self.artifact_path(feature, name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).with_context(|| format!("remove {}", path.display())),
            }
        }
        Ok(())
    }
}
