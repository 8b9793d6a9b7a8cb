//! Heal-loop state derived purely from a feature's run log.
//!
//! The controller never keeps state between invocations; after a restart it asks
//! `next_action` what the durable log implies and continues from there.

use std::collections::BTreeSet;

use crate::core::invariants::{attempt_count, terminal_kind};
use crate::core::types::{FailureCategory, StageKind, StageOutcome, StageRecord};

/// Attempt budget and escalation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealPolicy {
    pub max_attempts: u32,
    pub deep_analysis_threshold: u32,
}

impl Default for HealPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            deep_analysis_threshold: 12,
        }
    }
}

/// What the controller must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealAction {
    /// The log is closed by SUCCESS or ABANDONED.
    Finished(StageKind),
    /// Execute the test as attempt `attempt`.
    RunTest { attempt: u32 },
    /// The last RUN passed but SUCCESS was never recorded.
    RecordSuccess { attempt: u32 },
    /// The last RUN failed and has no FIX yet.
    Diagnose {
        attempt: u32,
        error: String,
        category: Option<FailureCategory>,
    },
    /// Budget exhausted without a pass.
    Abandon { attempt: u32 },
}

pub fn next_action(records: &[StageRecord], policy: HealPolicy) -> HealAction {
    if let Some(kind) = terminal_kind(records) {
        return HealAction::Finished(kind);
    }

    let attempts = attempt_count(records);
    let last_run = records.iter().rev().find(|r| r.kind == StageKind::Run);

    match last_run {
        Some(run) if run.outcome == Some(StageOutcome::Pass) => {
            return HealAction::RecordSuccess { attempt: attempts };
        }
        Some(run) if run.is_failed_run() && !has_fix_for(records, attempts) => {
            if attempts >= policy.max_attempts {
                return HealAction::Abandon { attempt: attempts };
            }
            return HealAction::Diagnose {
                attempt: attempts,
                error: run.error_text().unwrap_or_default().to_string(),
                category: run.category(),
            };
        }
        _ => {}
    }

    if attempts >= policy.max_attempts {
        return HealAction::Abandon { attempt: attempts };
    }
    HealAction::RunTest {
        attempt: attempts + 1,
    }
}

/// Deep analysis is owed once the threshold is reached and none was recorded.
pub fn needs_deep_analysis(records: &[StageRecord], policy: HealPolicy, attempt: u32) -> bool {
    attempt >= policy.deep_analysis_threshold
        && !records.iter().any(|r| r.kind == StageKind::DeepAnalysis)
}

/// Every hypothesis already recorded by a FIX for this feature.
pub fn tried_hypotheses(records: &[StageRecord]) -> BTreeSet<String> {
    records
        .iter()
        .filter_map(StageRecord::hypothesis)
        .map(str::to_string)
        .collect()
}

/// Hypotheses in the order they were attempted.
pub fn attempted_hypotheses(records: &[StageRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(StageRecord::hypothesis)
        .map(str::to_string)
        .collect()
}

fn has_fix_for(records: &[StageRecord], attempt: u32) -> bool {
    records
        .iter()
        .any(|r| r.kind == StageKind::Fix && r.attempt == Some(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failed_run, fix, record};

    const POLICY: HealPolicy = HealPolicy {
        max_attempts: 3,
        deep_analysis_threshold: 2,
    };

    #[test]
    fn empty_log_runs_first_attempt() {
        assert_eq!(next_action(&[], POLICY), HealAction::RunTest { attempt: 1 });
    }

    #[test]
    fn failed_run_without_fix_is_diagnosed() {
        let log = vec![failed_run(1, "strict mode violation", "LOCATOR")];
        assert_eq!(
            next_action(&log, POLICY),
            HealAction::Diagnose {
                attempt: 1,
                error: "strict mode violation".to_string(),
                category: Some(FailureCategory::Locator),
            }
        );
    }

    #[test]
    fn recorded_fix_resumes_with_next_run() {
        let log = vec![
            failed_run(1, "timeout", "WAIT"),
            fix(1, "wait.visible-before-action"),
        ];
        assert_eq!(next_action(&log, POLICY), HealAction::RunTest { attempt: 2 });
    }

    #[test]
    fn passed_run_without_success_records_success() {
        let log = vec![record(StageKind::Run, Some(1), Some(StageOutcome::Pass))];
        assert_eq!(
            next_action(&log, POLICY),
            HealAction::RecordSuccess { attempt: 1 }
        );
    }

    #[test]
    fn failure_at_budget_abandons() {
        let log = vec![
            failed_run(1, "x", "UNKNOWN"),
            fix(1, "rediagnose-1"),
            failed_run(2, "x", "UNKNOWN"),
            record(StageKind::DeepAnalysis, None, None),
            fix(2, "rediagnose-2"),
            failed_run(3, "x", "UNKNOWN"),
        ];
        assert_eq!(next_action(&log, POLICY), HealAction::Abandon { attempt: 3 });
    }

    #[test]
    fn closed_log_is_finished() {
        let log = vec![
            record(StageKind::Run, Some(1), Some(StageOutcome::Pass)),
            record(StageKind::Success, None, None),
        ];
        assert_eq!(
            next_action(&log, POLICY),
            HealAction::Finished(StageKind::Success)
        );
    }

    #[test]
    fn deep_analysis_is_owed_once() {
        let mut log = vec![failed_run(1, "x", "WAIT")];
        assert!(!needs_deep_analysis(&log, POLICY, 1));
        assert!(needs_deep_analysis(&log, POLICY, 2));
        log.push(record(StageKind::DeepAnalysis, None, None));
        assert!(!needs_deep_analysis(&log, POLICY, 2));
    }

    #[test]
    fn tried_hypotheses_collects_fix_outcomes() {
        let log = vec![
            failed_run(1, "x", "WAIT"),
            fix(1, "wait.response"),
            failed_run(2, "x", "WAIT"),
            fix(2, "wait.url-change"),
        ];
        let tried = tried_hypotheses(&log);
        assert!(tried.contains("wait.response"));
        assert!(tried.contains("wait.url-change"));
        assert_eq!(
            attempted_hypotheses(&log),
            vec!["wait.response".to_string(), "wait.url-change".to_string()]
        );
    }
}
