//! Durable per-feature run logs (`.autoheal/runlogs/<feature>.md`).
//!
//! A run log is a Markdown document with one section per stage record. Every
//! section opens with the literal marker `<!-- autoheal:stage <KIND> -->`, then a
//! heading for humans, then a fenced `json` block holding the record on a single
//! line. The marker and the JSON block are the parsing contract; headings are
//! decoration.
//!
//! `append` is the only mutator. It takes the feature's named lock, re-reads the
//! log, checks the new record against [`admit_entry`], and appends one section
//! with a single write.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use jsonschema::Validator;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::invariants::{
    AdmissionPolicy, OVERRIDE_KEY, admit_entry, attempt_count, validate_run_log,
};
use crate::core::types::{StageEntry, StageKind, StageRecord};
use crate::io::config::AutohealConfig;
use crate::io::lock::{self, LockError};
use crate::io::paths::{AutohealPaths, validate_id};

const STAGE_RECORD_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/stage_record.schema.json"
));

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^<!-- autoheal:stage ([A-Z_]+) -->[ \t]*$").unwrap());

static RECORD_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(STAGE_RECORD_SCHEMA).expect("stage record schema should be json");
    jsonschema::validator_for(&schema).expect("stage record schema should compile")
});

#[derive(Debug, thiserror::Error)]
pub enum RunLogError {
    #[error("invalid feature id: {0}")]
    InvalidFeature(String),
    #[error("no run log for feature '{feature}'")]
    NotFound { feature: String },
    #[error("run log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("run log for '{feature}' is locked by another writer")]
    LockContention {
        feature: String,
        #[source]
        source: LockError,
    },
    #[error("rejected {kind} for '{feature}': {reason}")]
    Rejected {
        feature: String,
        kind: StageKind,
        reason: String,
    },
    #[error("run log {path} is corrupt at section {section}: {reason}")]
    Corrupt {
        path: PathBuf,
        section: usize,
        reason: String,
    },
}

impl RunLogError {
    /// Only lock contention is worth retrying; everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

/// File-backed store of per-feature run logs.
#[derive(Debug, Clone)]
pub struct RunLogStore {
    paths: AutohealPaths,
    lock_timeout: Duration,
    policy: AdmissionPolicy,
}

impl RunLogStore {
    pub fn new(paths: AutohealPaths, lock_timeout: Duration, policy: AdmissionPolicy) -> Self {
        Self {
            paths,
            lock_timeout,
            policy,
        }
    }

    pub fn from_config(paths: AutohealPaths, cfg: &AutohealConfig) -> Self {
        Self::new(paths, cfg.lock_timeout(), cfg.admission_policy())
    }

    pub fn path(&self, feature: &str) -> PathBuf {
        self.paths.run_log_path(feature)
    }

    /// Append a record, stamping its timestamp (and attempt number for RUN/FIX
    /// when the caller left it empty).
    pub fn append(&self, feature: &str, entry: StageEntry) -> Result<StageRecord, RunLogError> {
        self.append_inner(feature, entry, false)
    }

    /// Append after a terminal record. The record is tagged `"override": true`.
    pub fn append_override(
        &self,
        feature: &str,
        entry: StageEntry,
    ) -> Result<StageRecord, RunLogError> {
        let entry = entry.with_note(OVERRIDE_KEY, true);
        self.append_inner(feature, entry, true)
    }

    #[instrument(skip_all, fields(feature = %feature, kind = %entry.kind))]
    fn append_inner(
        &self,
        feature: &str,
        entry: StageEntry,
        override_terminal: bool,
    ) -> Result<StageRecord, RunLogError> {
        check_feature(feature)?;
        let path = self.path(feature);
        let _guard = lock::acquire(&self.paths.run_log_lock_path(feature), self.lock_timeout)
            .map_err(|source| match source {
                LockError::Contended { .. } => RunLogError::LockContention {
                    feature: feature.to_string(),
                    source,
                },
                LockError::Io { path, source } => RunLogError::Io { path, source },
            })?;

        let records = self.read_optional(feature)?.unwrap_or_default();
        let attempt = admit_entry(&records, &entry, self.policy, override_terminal).map_err(
            |reason| RunLogError::Rejected {
                feature: feature.to_string(),
                kind: entry.kind,
                reason,
            },
        )?;

        // Keep timestamps non-decreasing even if the wall clock steps back.
        let mut timestamp = Utc::now();
        if let Some(last) = records.last()
            && last.timestamp > timestamp
        {
            timestamp = last.timestamp;
        }
        let record = StageRecord {
            kind: entry.kind,
            timestamp,
            attempt,
            outcome: entry.outcome,
            payload: entry.payload,
        };

        let mut section = String::new();
        if records.is_empty() && !path.exists() {
            section.push_str(&render_header(feature));
        }
        section.push_str(&render_section(&path, records.len() + 1, &record)?);
        write_section(&path, &section)?;

        info!(
            feature,
            kind = %record.kind,
            attempt = ?record.attempt,
            "stage recorded"
        );
        Ok(record)
    }

    /// Ordered records, or `NotFound` when the feature has no log yet.
    pub fn read(&self, feature: &str) -> Result<Vec<StageRecord>, RunLogError> {
        self.read_optional(feature)?
            .ok_or_else(|| RunLogError::NotFound {
                feature: feature.to_string(),
            })
    }

    /// Ordered records, or `None` when the feature has no log yet.
    pub fn read_optional(&self, feature: &str) -> Result<Option<Vec<StageRecord>>, RunLogError> {
        check_feature(feature)?;
        let path = self.path(feature);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(RunLogError::Io { path, source }),
        };
        let records = parse_document(&path, &contents)?;
        debug!(feature, records = records.len(), "run log loaded");
        Ok(Some(records))
    }

    pub fn exists(&self, feature: &str) -> Result<bool, RunLogError> {
        check_feature(feature)?;
        Ok(self.path(feature).is_file())
    }

    pub fn has_stage(&self, feature: &str, kind: StageKind) -> Result<bool, RunLogError> {
        Ok(self
            .read_optional(feature)?
            .is_some_and(|records| records.iter().any(|r| r.kind == kind)))
    }

    pub fn attempt_count(&self, feature: &str) -> Result<u32, RunLogError> {
        Ok(self
            .read_optional(feature)?
            .map(|records| attempt_count(&records))
            .unwrap_or(0))
    }

    pub fn last_stage(&self, feature: &str) -> Result<Option<StageRecord>, RunLogError> {
        Ok(self
            .read_optional(feature)?
            .and_then(|mut records| records.pop()))
    }

    /// True when the newest record is younger than `window_secs`.
    pub fn recently_updated(&self, feature: &str, window_secs: u64) -> Result<bool, RunLogError> {
        let Some(last) = self.last_stage(feature)? else {
            return Ok(false);
        };
        let age = Utc::now().signed_duration_since(last.timestamp);
        Ok(age.num_seconds() <= i64::try_from(window_secs).unwrap_or(i64::MAX))
    }

    /// Every invariant violation in an existing log.
    pub fn validate(&self, feature: &str) -> Result<Vec<String>, RunLogError> {
        let records = self.read(feature)?;
        Ok(validate_run_log(&records, self.policy))
    }

    /// Features with a run log, sorted.
    pub fn features(&self) -> Result<Vec<String>, RunLogError> {
        let dir = &self.paths.runlogs_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RunLogError::Io {
                    path: dir.clone(),
                    source,
                });
            }
        };
        let mut features = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| RunLogError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "md")
                && let Some(stem) = path.file_stem()
            {
                features.push(stem.to_string_lossy().into_owned());
            }
        }
        features.sort();
        Ok(features)
    }
}

fn check_feature(feature: &str) -> Result<(), RunLogError> {
    validate_id("feature", feature).map_err(|err| RunLogError::InvalidFeature(err.to_string()))
}

fn render_header(feature: &str) -> String {
    format!("# Run log: {feature}\n")
}

fn render_section(path: &Path, index: usize, record: &StageRecord) -> Result<String, RunLogError> {
    let json = serde_json::to_string(record).map_err(|err| RunLogError::Io {
        path: path.to_path_buf(),
        source: io::Error::other(err),
    })?;
    let mut heading = format!("### {index}. {}", record.kind);
    if let Some(attempt) = record.attempt {
        heading.push_str(&format!(" (attempt {attempt})"));
    }
    match (&record.outcome, record.hypothesis()) {
        (_, Some(hypothesis)) => {
            let shown: String = hypothesis.chars().filter(|c| !c.is_control()).collect();
            heading.push_str(&format!(" - {shown}"));
        }
        (Some(outcome), None) => heading.push_str(&format!(" - {outcome:?}").to_uppercase()),
        (None, None) => {}
    }
    Ok(format!(
        "\n<!-- autoheal:stage {} -->\n{heading}\n\n```json\n{json}\n```\n",
        record.kind
    ))
}

fn write_section(path: &Path, section: &str) -> Result<(), RunLogError> {
    let io_err = |source| RunLogError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(section.as_bytes()).map_err(io_err)?;
    file.sync_data().map_err(io_err)
}

/// Parse every section of a run-log document.
pub fn parse_document(path: &Path, contents: &str) -> Result<Vec<StageRecord>, RunLogError> {
    let corrupt = |section: usize, reason: String| RunLogError::Corrupt {
        path: path.to_path_buf(),
        section,
        reason,
    };

    let markers: Vec<_> = MARKER_RE.captures_iter(contents).collect();
    let mut records = Vec::with_capacity(markers.len());
    for (idx, caps) in markers.iter().enumerate() {
        let section = idx + 1;
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let marker_kind: StageKind = caps[1]
            .parse()
            .map_err(|err: String| corrupt(section, err))?;
        let end = markers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(contents.len());
        let body = &contents[whole.end()..end];
        let json = extract_json_line(body)
            .ok_or_else(|| corrupt(section, "missing ```json block".to_string()))?;
        let value: Value = serde_json::from_str(json)
            .map_err(|err| corrupt(section, format!("invalid json: {err}")))?;
        if !RECORD_VALIDATOR.is_valid(&value) {
            let messages = RECORD_VALIDATOR
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Err(corrupt(section, messages.join("; ")));
        }
        let record: StageRecord = serde_json::from_value(value)
            .map_err(|err| corrupt(section, format!("invalid record: {err}")))?;
        if record.kind != marker_kind {
            return Err(corrupt(
                section,
                format!("marker says {marker_kind} but record is {}", record.kind),
            ));
        }
        records.push(record);
    }
    Ok(records)
}

fn extract_json_line(body: &str) -> Option<&str> {
    let mut lines = body.lines().skip_while(|line| line.trim() != "```json");
    lines.next()?;
    let json = lines.next()?.trim();
    if lines.next()?.trim() != "```" {
        return None;
    }
    Some(json)
}
