//! Shared deterministic types for the stage model.
//!
//! These types define the stable contract between the run-log document, the gate
//! rules and the heal loop. They must not depend on external state or I/O.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Pipeline stage recorded in a feature's run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    Analyze,
    Research,
    Plan,
    Write,
    Run,
    Fix,
    DeepAnalysis,
    Success,
    Abandoned,
    Learn,
}

impl StageKind {
    pub const ALL: [StageKind; 10] = [
        StageKind::Analyze,
        StageKind::Research,
        StageKind::Plan,
        StageKind::Write,
        StageKind::Run,
        StageKind::Fix,
        StageKind::DeepAnalysis,
        StageKind::Success,
        StageKind::Abandoned,
        StageKind::Learn,
    ];

    /// Stable marker name used in run-log documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "ANALYZE",
            Self::Research => "RESEARCH",
            Self::Plan => "PLAN",
            Self::Write => "WRITE",
            Self::Run => "RUN",
            Self::Fix => "FIX",
            Self::DeepAnalysis => "DEEP_ANALYSIS",
            Self::Success => "SUCCESS",
            Self::Abandoned => "ABANDONED",
            Self::Learn => "LEARN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Abandoned)
    }

    /// RUN and FIX records carry an attempt number; nothing else does.
    pub fn is_attempt_scoped(&self) -> bool {
        matches!(self, Self::Run | Self::Fix)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        StageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown stage kind '{s}'"))
    }
}

/// Outcome attached to RUN (`PASS`/`FAIL`) and FIX (hypothesis id) records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageOutcome {
    Pass,
    Fail,
    Hypothesis(String),
}

impl StageOutcome {
    pub fn hypothesis(&self) -> Option<&str> {
        match self {
            Self::Hypothesis(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

/// Immutable entry in a feature's run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub kind: StageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StageOutcome>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl StageRecord {
    pub fn is_failed_run(&self) -> bool {
        self.kind == StageKind::Run && self.outcome == Some(StageOutcome::Fail)
    }

    pub fn hypothesis(&self) -> Option<&str> {
        if self.kind != StageKind::Fix {
            return None;
        }
        self.outcome.as_ref().and_then(StageOutcome::hypothesis)
    }

    /// Failure category stored in a RUN/FIX payload, if any.
    pub fn category(&self) -> Option<FailureCategory> {
        self.payload
            .get("category")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
    }

    /// Error excerpt stored in a failed RUN payload.
    pub fn error_text(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }
}

/// Record requested by a caller; the store stamps the timestamp and may assign the
/// attempt number for RUN/FIX.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEntry {
    pub kind: StageKind,
    pub attempt: Option<u32>,
    pub outcome: Option<StageOutcome>,
    pub payload: Map<String, Value>,
}

impl StageEntry {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            attempt: None,
            outcome: None,
            payload: Map::new(),
        }
    }

    pub fn run(outcome: StageOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Self::new(StageKind::Run)
        }
    }

    pub fn fix(hypothesis: impl Into<String>) -> Self {
        Self {
            outcome: Some(StageOutcome::Hypothesis(hypothesis.into())),
            ..Self::new(StageKind::Fix)
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_note(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload.extend(payload);
        self
    }
}

/// Failure taxonomy used by the heal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    Locator,
    Wait,
    Assertion,
    Auth,
    Env,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locator => "LOCATOR",
            Self::Wait => "WAIT",
            Self::Assertion => "ASSERTION",
            Self::Auth => "AUTH",
            Self::Env => "ENV",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOCATOR" => Ok(Self::Locator),
            "WAIT" => Ok(Self::Wait),
            "ASSERTION" => Ok(Self::Assertion),
            "AUTH" => Ok(Self::Auth),
            "ENV" => Ok(Self::Env),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(format!("unknown failure category '{other}'")),
        }
    }
}
