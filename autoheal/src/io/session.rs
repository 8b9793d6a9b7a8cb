//! Ephemeral per-session state (`.autoheal/sessions/<session>.json`).
//!
//! Every operation takes the session's named lock, re-reads the file, and
//! writes it back atomically. Sessions for different ids never contend.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::io::lock::{self, LockError, LockGuard};
use crate::io::paths::{AutohealPaths, validate_id};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session id: {0}")]
    InvalidSession(String),
    #[error("session {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("session '{session}' is locked by another caller")]
    LockContention {
        session: String,
        #[source]
        source: LockError,
    },
    #[error("session file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

/// Persisted session state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub hint_flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub tool_usage_counters: BTreeMap<String, u64>,
}

impl Session {
    fn new(session_id: &str, project_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            project_id: project_id.to_string(),
            started_at: Utc::now(),
            hint_flags: BTreeMap::new(),
            tool_usage_counters: BTreeMap::new(),
        }
    }
}

/// Counters captured when a session ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub tool_usage_counters: BTreeMap<String, u64>,
}

impl SessionSummary {
    /// Short report, one line per counter sorted by name.
    pub fn render(&self) -> String {
        if self.tool_usage_counters.is_empty() {
            return "No tool usage recorded.\n".to_string();
        }
        let mut out = String::from("Tool usage this session:\n");
        for (name, count) in &self.tool_usage_counters {
            let _ = writeln!(out, "  {name}: {count}");
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    paths: AutohealPaths,
    lock_timeout: Duration,
}

impl SessionStore {
    pub fn new(paths: AutohealPaths, lock_timeout: Duration) -> Self {
        Self {
            paths,
            lock_timeout,
        }
    }

    /// Create (or reset) the session: hint flags cleared, counters zeroed.
    #[instrument(skip(self))]
    pub fn init(&self, session_id: &str, project_id: &str) -> Result<Session, SessionError> {
        let _guard = self.lock(session_id)?;
        let session = Session::new(session_id, project_id);
        self.save(&session)?;
        debug!(session_id, project_id, "session initialised");
        Ok(session)
    }

    pub fn load(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        check_session(session_id)?;
        let path = self.paths.session_path(session_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SessionError::Io { path, source }),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| SessionError::Corrupt {
                path,
                reason: err.to_string(),
            })
    }

    pub fn hint_delivered(&self, session_id: &str, category: &str) -> Result<bool, SessionError> {
        Ok(self
            .load(session_id)?
            .and_then(|session| session.hint_flags.get(category).copied())
            .unwrap_or(false))
    }

    /// Set the flag for `category`. Never cleared until `init`/`teardown`.
    #[instrument(skip(self))]
    pub fn mark_hint_delivered(
        &self,
        session_id: &str,
        category: &str,
    ) -> Result<(), SessionError> {
        self.update(session_id, |session| {
            session.hint_flags.insert(category.to_string(), true);
        })
        .map(|_| ())
    }

    /// Bump the usage counter for `tool` and return its new value.
    #[instrument(skip(self))]
    pub fn increment_tool_usage(&self, session_id: &str, tool: &str) -> Result<u64, SessionError> {
        let session = self.update(session_id, |session| {
            *session
                .tool_usage_counters
                .entry(tool.to_string())
                .or_insert(0) += 1;
        })?;
        Ok(session.tool_usage_counters.get(tool).copied().unwrap_or(0))
    }

    /// Snapshot counters and delete the session state.
    #[instrument(skip(self))]
    pub fn teardown(&self, session_id: &str) -> Result<SessionSummary, SessionError> {
        let _guard = self.lock(session_id)?;
        let Some(session) = self.load(session_id)? else {
            return Ok(SessionSummary::default());
        };
        let path = self.paths.session_path(session_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(SessionError::Io { path, source }),
        }
        debug!(session_id, "session torn down");
        Ok(SessionSummary {
            tool_usage_counters: session.tool_usage_counters,
        })
    }

    fn update(
        &self,
        session_id: &str,
        mutate: impl FnOnce(&mut Session),
    ) -> Result<Session, SessionError> {
        let _guard = self.lock(session_id)?;
        let mut session = self
            .load(session_id)?
            .unwrap_or_else(|| Session::new(session_id, ""));
        mutate(&mut session);
        self.save(&session)?;
        Ok(session)
    }

    fn lock(&self, session_id: &str) -> Result<LockGuard, SessionError> {
        check_session(session_id)?;
        lock::acquire(&self.paths.session_lock_path(session_id), self.lock_timeout).map_err(
            |source| match source {
                LockError::Contended { .. } => SessionError::LockContention {
                    session: session_id.to_string(),
                    source,
                },
                LockError::Io { path, source } => SessionError::Io { path, source },
            },
        )
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.paths.session_path(&session.session_id);
        let mut buf = serde_json::to_string_pretty(session).map_err(|err| SessionError::Io {
            path: path.clone(),
            source: io::Error::other(err),
        })?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }
}

fn check_session(session_id: &str) -> Result<(), SessionError> {
    validate_id("session", session_id).map_err(|err| SessionError::InvalidSession(err.to_string()))
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), SessionError> {
    let io_err = |source| SessionError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).map_err(io_err)?;
    fs::rename(&tmp_path, path).map_err(io_err)
}
