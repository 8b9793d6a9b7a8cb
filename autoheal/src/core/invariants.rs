//! Run-log invariants.
//!
//! `admit_entry` is the single admission rule used by the store under its lock;
//! `validate_run_log` replays the same rule over a whole log for audits.

use crate::core::hypotheses::is_valid_hypothesis_id;
use crate::core::types::{StageEntry, StageKind, StageOutcome, StageRecord};

/// Payload key marking a record appended through the override path.
pub const OVERRIDE_KEY: &str = "override";

/// Admission policy knobs that depend on configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdmissionPolicy {
    /// FIX records at or above this attempt require a prior DEEP_ANALYSIS.
    pub deep_analysis_threshold: Option<u32>,
}

/// Number of RUN records.
pub fn attempt_count(records: &[StageRecord]) -> u32 {
    records.iter().filter(|r| r.kind == StageKind::Run).count() as u32
}

/// True when the last terminal record has not been reopened by an override.
pub fn is_closed(records: &[StageRecord]) -> bool {
    let Some(terminal_idx) = records.iter().rposition(|r| r.kind.is_terminal()) else {
        return false;
    };
    !records[terminal_idx + 1..].iter().any(is_override)
}

/// Most recent terminal kind if the log is closed.
pub fn terminal_kind(records: &[StageRecord]) -> Option<StageKind> {
    if !is_closed(records) {
        return None;
    }
    records
        .iter()
        .rev()
        .find(|r| r.kind.is_terminal())
        .map(|r| r.kind)
}

pub fn is_override(record: &StageRecord) -> bool {
    record
        .payload
        .get(OVERRIDE_KEY)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Decide whether `entry` may be appended after `records`.
///
/// Returns the attempt number to stamp on the record (assigned when the caller
/// left it empty), or a human-readable rejection.
pub fn admit_entry(
    records: &[StageRecord],
    entry: &StageEntry,
    policy: AdmissionPolicy,
    override_terminal: bool,
) -> Result<Option<u32>, String> {
    let kind = entry.kind;

    if !override_terminal && is_closed(records) && blocked_after_terminal(kind) {
        let terminal = terminal_kind(records).unwrap_or(StageKind::Success);
        return Err(format!(
            "{kind} not allowed after {terminal} without an explicit override"
        ));
    }

    match kind {
        StageKind::Run => {
            match &entry.outcome {
                Some(StageOutcome::Pass | StageOutcome::Fail) => {}
                _ => return Err("RUN requires outcome PASS or FAIL".to_string()),
            }
            let expected = attempt_count(records) + 1;
            match entry.attempt {
                Some(n) if n != expected => Err(format!(
                    "RUN attempt {n} out of order (expected {expected})"
                )),
                _ => Ok(Some(expected)),
            }
        }
        StageKind::Fix => {
            let Some(hypothesis) = entry.outcome.as_ref().and_then(StageOutcome::hypothesis) else {
                return Err("FIX requires a hypothesis id".to_string());
            };
            if !is_valid_hypothesis_id(hypothesis) {
                return Err(format!(
                    "FIX hypothesis id {hypothesis:?} must be [A-Za-z0-9._-] only"
                ));
            }
            let current = attempt_count(records);
            if current == 0 {
                return Err("FIX requires a preceding RUN".to_string());
            }
            if let Some(n) = entry.attempt
                && n != current
            {
                return Err(format!("FIX attempt {n} does not match current attempt {current}"));
            }
            let last_run = records.iter().rev().find(|r| r.kind == StageKind::Run);
            if !last_run.is_some_and(StageRecord::is_failed_run) {
                return Err(format!("FIX for attempt {current} requires a failed RUN"));
            }
            if records
                .iter()
                .any(|r| r.kind == StageKind::Fix && r.attempt == Some(current))
            {
                return Err(format!("FIX for attempt {current} already recorded"));
            }
            if let Some(threshold) = policy.deep_analysis_threshold
                && current >= threshold
                && !has_kind(records, StageKind::DeepAnalysis)
            {
                return Err(format!(
                    "FIX at attempt {current} requires DEEP_ANALYSIS first (threshold {threshold})"
                ));
            }
            Ok(Some(current))
        }
        _ => {
            if entry.attempt.is_some() {
                return Err(format!("{kind} does not carry an attempt number"));
            }
            if entry.outcome.is_some() {
                return Err(format!("{kind} does not carry an outcome"));
            }
            if kind == StageKind::DeepAnalysis {
                if has_kind(records, StageKind::DeepAnalysis) {
                    return Err("DEEP_ANALYSIS already recorded".to_string());
                }
                let attempts = attempt_count(records);
                if let Some(threshold) = policy.deep_analysis_threshold
                    && attempts < threshold
                {
                    return Err(format!(
                        "DEEP_ANALYSIS is reserved for attempt {threshold} (log is at attempt {attempts}); record RESEARCH instead"
                    ));
                }
            }
            Ok(None)
        }
    }
}

/// Replay admission over a full log and list every violation.
pub fn validate_run_log(records: &[StageRecord], policy: AdmissionPolicy) -> Vec<String> {
    let mut errors = Vec::new();
    for (idx, record) in records.iter().enumerate() {
        let entry = StageEntry {
            kind: record.kind,
            attempt: record.attempt,
            outcome: record.outcome.clone(),
            payload: record.payload.clone(),
        };
        let prefix = &records[..idx];
        match admit_entry(prefix, &entry, policy, is_override(record)) {
            Ok(expected) => {
                if record.kind.is_attempt_scoped() && record.attempt != expected {
                    errors.push(format!(
                        "record {}: {} missing attempt number",
                        idx + 1,
                        record.kind
                    ));
                }
            }
            Err(reason) => errors.push(format!("record {}: {reason}", idx + 1)),
        }
        if idx > 0 && record.timestamp < records[idx - 1].timestamp {
            errors.push(format!("record {}: timestamp goes backwards", idx + 1));
        }
    }
    errors
}

fn has_kind(records: &[StageRecord], kind: StageKind) -> bool {
    records.iter().any(|r| r.kind == kind)
}

fn blocked_after_terminal(kind: StageKind) -> bool {
    matches!(
        kind,
        StageKind::Run
            | StageKind::Fix
            | StageKind::DeepAnalysis
            | StageKind::Success
            | StageKind::Abandoned
    )
}
