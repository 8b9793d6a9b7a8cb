//! Engine configuration stored under `.autoheal/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::ClassifierRule;
use crate::core::heal_state::HealPolicy;
use crate::core::invariants::AdmissionPolicy;
use crate::io::paths::validate_id;

/// Engine configuration (TOML).
///
/// Edited by humans and by the coordinating process. Missing fields default to
/// the reference policy (25 attempts, deep analysis at attempt 12, 180s research
/// worker).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AutohealConfig {
    pub heal: HealConfig,
    pub gate: GateConfig,
    pub run_log: RunLogConfig,
    pub context: ContextConfig,
    pub test: TestConfig,
    pub hooks: HooksConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealConfig {
    /// Attempts before the feature is abandoned.
    pub max_attempts: u32,
    /// Attempt at which the one-time deep analysis runs.
    pub deep_analysis_threshold: u32,
    /// Bytes of failure output kept in each RUN record.
    pub error_excerpt_bytes: usize,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            deep_analysis_threshold: 12,
            error_excerpt_bytes: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Consecutive same-category failures after which retries need new research.
    pub same_category_failure_limit: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            same_category_failure_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunLogConfig {
    pub lock_timeout_ms: u64,
}

impl Default for RunLogConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
        }
    }
}

/// What a second `build` does while one is in flight for the same feature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildConcurrency {
    /// Wait for the in-flight build and return its result.
    #[default]
    Share,
    /// Return an "already building" error immediately.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Artifact names that must all exist for a bundle to count (stored as `<name>.md`).
    pub required_artifacts: Vec<String>,
    /// Research worker argv; the rendered request is piped to stdin.
    pub worker_command: Vec<String>,
    pub worker_timeout_secs: u64,
    pub worker_output_limit_bytes: usize,
    pub concurrency: BuildConcurrency,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            required_artifacts: vec!["patterns".to_string(), "codebase".to_string()],
            worker_command: vec!["claude".to_string(), "-p".to_string()],
            worker_timeout_secs: 180,
            worker_output_limit_bytes: 100_000,
            concurrency: BuildConcurrency::Share,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestConfig {
    /// Test runner argv; the feature id is appended.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "npx".to_string(),
                "playwright".to_string(),
                "test".to_string(),
            ],
            timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

/// Commands standing in for the external fixer, evidence and file-move workers.
///
/// Empty commands are skipped (the step is logged and treated as done).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HooksConfig {
    pub fix_command: Vec<String>,
    pub evidence_command: Vec<String>,
    pub promote_command: Vec<String>,
    pub pending_command: Vec<String>,
    pub hook_timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            fix_command: Vec::new(),
            evidence_command: Vec::new(),
            promote_command: Vec::new(),
            pending_command: Vec::new(),
            hook_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Ordered override table; empty selects the built-in table.
    pub rules: Vec<ClassifierRule>,
}

impl AutohealConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heal.max_attempts == 0 {
            return Err(anyhow!("heal.max_attempts must be > 0"));
        }
        if self.heal.deep_analysis_threshold == 0
            || self.heal.deep_analysis_threshold > self.heal.max_attempts
        {
            return Err(anyhow!(
                "heal.deep_analysis_threshold must be within 1..=heal.max_attempts ({})",
                self.heal.max_attempts
            ));
        }
        if self.heal.error_excerpt_bytes == 0 {
            return Err(anyhow!("heal.error_excerpt_bytes must be > 0"));
        }
        if self.gate.same_category_failure_limit == 0 {
            return Err(anyhow!("gate.same_category_failure_limit must be > 0"));
        }
        if self.run_log.lock_timeout_ms == 0 {
            return Err(anyhow!("run_log.lock_timeout_ms must be > 0"));
        }
        if self.context.required_artifacts.is_empty() {
            return Err(anyhow!("context.required_artifacts must not be empty"));
        }
        for name in &self.context.required_artifacts {
            validate_id("artifact", name)?;
        }
        if !is_command(&self.context.worker_command) {
            return Err(anyhow!("context.worker_command must be a non-empty array"));
        }
        if self.context.worker_timeout_secs == 0 {
            return Err(anyhow!("context.worker_timeout_secs must be > 0"));
        }
        if self.context.worker_output_limit_bytes == 0 {
            return Err(anyhow!("context.worker_output_limit_bytes must be > 0"));
        }
        if !is_command(&self.test.command) {
            return Err(anyhow!("test.command must be a non-empty array"));
        }
        if self.test.timeout_secs == 0 {
            return Err(anyhow!("test.timeout_secs must be > 0"));
        }
        if self.test.output_limit_bytes == 0 {
            return Err(anyhow!("test.output_limit_bytes must be > 0"));
        }
        if self.hooks.hook_timeout_secs == 0 {
            return Err(anyhow!("hooks.hook_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn heal_policy(&self) -> HealPolicy {
        HealPolicy {
            max_attempts: self.heal.max_attempts,
            deep_analysis_threshold: self.heal.deep_analysis_threshold,
        }
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            deep_analysis_threshold: Some(self.heal.deep_analysis_threshold),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.run_log.lock_timeout_ms)
    }
}

fn is_command(argv: &[String]) -> bool {
    argv.first().is_some_and(|program| !program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutohealConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutohealConfig> {
    if !path.exists() {
        let cfg = AutohealConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutohealConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutohealConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
