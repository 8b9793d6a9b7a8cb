//! Context builder: populate a feature's bundle with at most one research worker.
//!
//! Fast path: a complete bundle is returned as-is without any subprocess.
//! Otherwise the build lock (`locks/build-<feature>.lock`) makes the build
//! single-flight. A caller that finds the lock busy either waits and shares the
//! leader's outcome (`share`) or gets `already_building` (`reject`). The leader
//! writes its outcome to `context/<feature>/build_result.json` for followers.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::config::{AutohealConfig, BuildConcurrency};
use crate::io::context::ContextCache;
use crate::io::lock::{self, LockError};
use crate::io::paths::{AutohealPaths, validate_id};
use crate::io::worker::{ResearchRequest, ResearchWorker, WorkerExit};

const BUILD_RESULT_FILE: &str = "build_result.json";
const WORKER_LOG_FILE: &str = "worker.log";
/// Extra time a follower waits beyond the worker timeout.
const SHARE_WAIT_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    pub feature: String,
    pub ticket: Option<String>,
    pub description: Option<String>,
    pub force: bool,
}

impl BuildRequest {
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFailure {
    Timeout,
    Validation,
    Crash,
    AlreadyBuilding,
}

/// Outcome reported to the caller (`{"status":"ok",...}` / `{"status":"error",...}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BuildResult {
    Ok {
        path: PathBuf,
        files: Vec<String>,
    },
    Error {
        reason: BuildFailure,
        message: String,
    },
}

impl BuildResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    fn error(reason: BuildFailure, message: impl Into<String>) -> Self {
        Self::Error {
            reason,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildRecord {
    finished_at: DateTime<Utc>,
    result: BuildResult,
}

pub struct ContextBuilder<'a, W: ResearchWorker> {
    pub paths: &'a AutohealPaths,
    pub cache: &'a ContextCache,
    pub worker: &'a W,
    pub concurrency: BuildConcurrency,
    /// How long a sharing caller waits for the in-flight build.
    pub share_timeout: Duration,
}

impl<'a, W: ResearchWorker> ContextBuilder<'a, W> {
    pub fn from_config(
        paths: &'a AutohealPaths,
        cache: &'a ContextCache,
        worker: &'a W,
        cfg: &AutohealConfig,
    ) -> Self {
        Self {
            paths,
            cache,
            worker,
            concurrency: cfg.context.concurrency,
            share_timeout: Duration::from_secs(cfg.context.worker_timeout_secs)
                + SHARE_WAIT_MARGIN,
        }
    }

    /// Build (or reuse) the bundle for `request.feature`.
    ///
    /// Worker trouble is reported as `BuildResult::Error`; `Err` is reserved for
    /// failures of the engine's own state (unreadable layout, lock I/O).
    #[instrument(skip_all, fields(feature = %request.feature, force = request.force))]
    pub fn build(&self, request: &BuildRequest) -> Result<BuildResult> {
        let feature = request.feature.as_str();
        validate_id("feature", feature)?;

        if !request.force && self.cache.exists(feature)? {
            debug!("bundle already complete");
            return self.cached(feature);
        }

        let lock_path = self.paths.build_lock_path(feature);
        if let Some(_guard) = lock::try_acquire(&lock_path)? {
            return self.lead(request, request.force);
        }

        match self.concurrency {
            BuildConcurrency::Reject => {
                info!("build already in flight, rejecting");
                Ok(BuildResult::error(
                    BuildFailure::AlreadyBuilding,
                    format!("a context build for '{feature}' is already running"),
                ))
            }
            BuildConcurrency::Share => self.follow(request, &lock_path),
        }
    }

    fn follow(&self, request: &BuildRequest, lock_path: &Path) -> Result<BuildResult> {
        let feature = request.feature.as_str();
        let waiting_since = Utc::now();
        info!("build already in flight, waiting to share its result");
        let _guard = match lock::acquire(lock_path, self.share_timeout) {
            Ok(guard) => guard,
            Err(LockError::Contended { waited, .. }) => {
                return Ok(BuildResult::error(
                    BuildFailure::AlreadyBuilding,
                    format!("a context build for '{feature}' is still running after {waited:?}"),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(record) = self.read_record(feature)?
            && record.finished_at >= waiting_since
        {
            debug!(ok = record.result.is_ok(), "sharing in-flight build result");
            return Ok(record.result);
        }
        // The leader died without recording an outcome; build here unless the
        // bundle appeared anyway.
        self.lead(request, false)
    }

    /// Run the worker while holding the build lock.
    fn lead(&self, request: &BuildRequest, force: bool) -> Result<BuildResult> {
        let feature = request.feature.as_str();
        if !force && self.cache.exists(feature)? {
            return self.cached(feature);
        }

        let output_dir = self.cache.dir(feature);
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("create bundle dir {}", output_dir.display()))?;
        self.cache.clear_artifacts(feature)?;

        let research = ResearchRequest {
            feature: feature.to_string(),
            ticket: request.ticket.clone(),
            description: request.description.clone(),
            project_id: self.paths.project_id(),
            root: self.paths.root.clone(),
            log_path: output_dir.join(WORKER_LOG_FILE),
            output_dir,
            artifacts: self.cache.required_artifacts().to_vec(),
        };

        info!("spawning research worker");
        let result = match self.worker.research(&research) {
            Ok(WorkerExit::Completed) => self.validate_bundle(feature)?,
            Ok(WorkerExit::TimedOut { after }) => BuildResult::error(
                BuildFailure::Timeout,
                format!("research worker timed out after {}s and was killed", after.as_secs()),
            ),
            Ok(WorkerExit::Crashed { message }) => {
                BuildResult::error(
                    BuildFailure::Crash,
                    format!("research worker crashed: {message}"),
                )
            }
            Err(err) => BuildResult::error(
                BuildFailure::Crash,
                format!("research worker could not run: {err:#}"),
            ),
        };

        if let BuildResult::Error { reason, message } = &result {
            warn!(?reason, message = %message, "context build failed");
            self.cache.clear_artifacts(feature)?;
        }
        self.write_record(feature, &result)?;
        Ok(result)
    }

    fn validate_bundle(&self, feature: &str) -> Result<BuildResult> {
        let missing = self.cache.missing_artifacts(feature)?;
        if missing.is_empty() {
            info!("context bundle built");
            return self.cached(feature);
        }
        let produced = self.cache.required_artifacts().len() - missing.len();
        let shape = if produced == 0 { "no" } else { "a partial set of" };
        Ok(BuildResult::error(
            BuildFailure::Validation,
            format!(
                "research worker finished but wrote {shape} artifacts (missing: {})",
                missing.join(", ")
            ),
        ))
    }

    fn cached(&self, feature: &str) -> Result<BuildResult> {
        let files = self
            .cache
            .required_artifacts()
            .iter()
            .map(|name| format!("{name}.md"))
            .collect();
        Ok(BuildResult::Ok {
            path: self.cache.dir(feature),
            files,
        })
    }

    fn record_path(&self, feature: &str) -> PathBuf {
        self.cache.dir(feature).join(BUILD_RESULT_FILE)
    }

    fn read_record(&self, feature: &str) -> Result<Option<BuildRecord>> {
        let path = self.record_path(feature);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        match serde_json::from_str(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "ignoring unreadable build record");
                Ok(None)
            }
        }
    }

    fn write_record(&self, feature: &str, result: &BuildResult) -> Result<()> {
        let path = self.record_path(feature);
        let record = BuildRecord {
            finished_at: Utc::now(),
            result: result.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&record)?;
        buf.push('\n');
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| format!("replace {}", path.display()))
    }
}
