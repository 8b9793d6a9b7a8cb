//! Incident reports for test-infrastructure failures (`.autoheal/incidents/<feature>/`).
//!
//! An infrastructure failure never enters the run log. It lands here so a human
//! can fix the runner and resume the loop.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::io::paths::AutohealPaths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentMeta {
    pub feature: String,
    /// Attempt the loop was about to record when the runner broke.
    pub pending_attempt: u32,
    pub occurred_at: DateTime<Utc>,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct IncidentPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub output_path: PathBuf,
}

impl IncidentPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            meta_path: dir.join("incident.json"),
            output_path: dir.join("output.log"),
            dir,
        }
    }
}

/// Write one incident; `message` is the runner's raw failure text.
pub fn write_incident(
    paths: &AutohealPaths,
    feature: &str,
    pending_attempt: u32,
    message: &str,
) -> Result<IncidentPaths> {
    let occurred_at = Utc::now();
    let base = paths.incident_dir(feature);
    let stem = format!(
        "{}-attempt-{pending_attempt}",
        occurred_at.format("%Y%m%dT%H%M%S%.3fZ")
    );
    let incident = IncidentPaths::new(unique_dir(&base, &stem));
    fs::create_dir_all(&incident.dir)
        .with_context(|| format!("create incident dir {}", incident.dir.display()))?;

    let meta = IncidentMeta {
        feature: feature.to_string(),
        pending_attempt,
        occurred_at,
        summary: message.lines().next().unwrap_or_default().to_string(),
    };
    let mut buf = serde_json::to_string_pretty(&meta)?;
    buf.push('\n');
    write_text(&incident.meta_path, &buf)?;
    write_text(&incident.output_path, message)?;
    warn!(
        feature,
        pending_attempt,
        dir = %incident.dir.display(),
        "infrastructure incident recorded"
    );
    Ok(incident)
}

/// Incident metadata for a feature, oldest first.
pub fn list_incidents(paths: &AutohealPaths, feature: &str) -> Result<Vec<IncidentMeta>> {
    let base = paths.incident_dir(feature);
    if !base.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = fs::read_dir(&base)
        .with_context(|| format!("read {}", base.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("read {}", base.display()))?;
    dirs.sort();
    dirs.into_iter()
        .map(|dir| {
            let path = dir.join("incident.json");
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
        })
        .collect()
}

fn unique_dir(base: &Path, stem: &str) -> PathBuf {
    let candidate = base.join(stem);
    if !candidate.exists() {
        return candidate;
    }
    (2..)
        .map(|n| base.join(format!("{stem}.{n}")))
        .find(|dir| !dir.exists())
        .unwrap_or(candidate)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::paths::init_layout;

    #[test]
    fn incidents_are_written_and_listed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_layout(temp.path(), false).expect("init");
        let first =
            write_incident(&paths, "login", 4, "browser failed to launch\nstack").expect("write");
        assert!(first.meta_path.is_file());
        assert_eq!(
            fs::read_to_string(&first.output_path).expect("read"),
            "browser failed to launch\nstack"
        );
        write_incident(&paths, "login", 4, "again").expect("write");

        let incidents = list_incidents(&paths, "login").expect("list");
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].summary, "browser failed to launch");
        assert_eq!(incidents[0].pending_attempt, 4);
        assert!(list_incidents(&paths, "cart").expect("list").is_empty());
    }
}
