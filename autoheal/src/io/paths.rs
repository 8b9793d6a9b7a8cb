//! Layout of `.autoheal/` and feature/session id validation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{AutohealConfig, write_config};

/// All canonical paths within `.autoheal/` for a project root.
#[derive(Debug, Clone)]
pub struct AutohealPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub runlogs_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub context_dir: PathBuf,
    pub incidents_dir: PathBuf,
}

impl AutohealPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".autoheal");
        Self {
            root: root.clone(),
            config_path: state_dir.join("config.toml"),
            runlogs_dir: state_dir.join("runlogs"),
            locks_dir: state_dir.join("locks"),
            sessions_dir: state_dir.join("sessions"),
            context_dir: state_dir.join("context"),
            incidents_dir: state_dir.join("incidents"),
            state_dir,
        }
    }

    pub fn run_log_path(&self, feature: &str) -> PathBuf {
        self.runlogs_dir.join(format!("{feature}.md"))
    }

    pub fn run_log_lock_path(&self, feature: &str) -> PathBuf {
        self.locks_dir.join(format!("runlog-{feature}.lock"))
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    pub fn session_lock_path(&self, session_id: &str) -> PathBuf {
        self.locks_dir.join(format!("session-{session_id}.lock"))
    }

    pub fn bundle_dir(&self, feature: &str) -> PathBuf {
        self.context_dir.join(feature)
    }

    pub fn build_lock_path(&self, feature: &str) -> PathBuf {
        self.locks_dir.join(format!("build-{feature}.lock"))
    }

    pub fn incident_dir(&self, feature: &str) -> PathBuf {
        self.incidents_dir.join(feature)
    }

    /// Project identifier derived from the root directory name.
    pub fn project_id(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    }
}

/// Create the `.autoheal/` scaffolding; writes a default config unless one exists
/// (or `force` is set).
pub fn init_layout(root: &Path, force: bool) -> Result<AutohealPaths> {
    let paths = AutohealPaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "{} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    for dir in [
        &paths.state_dir,
        &paths.runlogs_dir,
        &paths.locks_dir,
        &paths.sessions_dir,
        &paths.context_dir,
        &paths.incidents_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    if force || !paths.config_path.exists() {
        write_config(&paths.config_path, &AutohealConfig::default())?;
    }
    Ok(paths)
}

/// Validate that an id is safe to use as a single path component.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("{kind} id must not be empty"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("{kind} id must not be '.' or '..'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("{kind} id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let paths = AutohealPaths::new("/work/shop");
        assert_eq!(
            paths.run_log_path("login"),
            Path::new("/work/shop/.autoheal/runlogs/login.md")
        );
        assert_eq!(
            paths.build_lock_path("login"),
            Path::new("/work/shop/.autoheal/locks/build-login.lock")
        );
        assert_eq!(
            paths.session_path("s-1"),
            Path::new("/work/shop/.autoheal/sessions/s-1.json")
        );
        assert_eq!(paths.project_id(), "shop");
    }

    #[test]
    fn init_creates_layout_and_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_layout(temp.path(), false).expect("init");
        assert!(paths.runlogs_dir.is_dir());
        assert!(paths.locks_dir.is_dir());
        assert!(paths.config_path.is_file());
    }

    #[test]
    fn init_keeps_existing_config_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_layout(temp.path(), false).expect("init");
        fs::write(&paths.config_path, "[heal]\nmax_attempts = 3\n").expect("write");
        init_layout(temp.path(), false).expect("re-init");
        let contents = fs::read_to_string(&paths.config_path).expect("read");
        assert!(contents.contains("max_attempts = 3"));
    }

    #[test]
    fn ids_reject_path_tricks() {
        assert!(validate_id("feature", "login-flow_2.v1").is_ok());
        assert!(validate_id("feature", "").is_err());
        assert!(validate_id("feature", "..").is_err());
        assert!(validate_id("feature", "a/b").is_err());
        assert!(validate_id("feature", "a b").is_err());
    }
}
