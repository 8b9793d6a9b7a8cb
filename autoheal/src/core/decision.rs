//! Gate decision rules.
//!
//! Pure functions over a snapshot of persisted state. Loading the snapshot is the
//! job of [`crate::gate`]; nothing here performs I/O.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::core::invariants::terminal_kind;
use crate::core::types::{FailureCategory, StageKind, StageRecord};

/// Side-effecting action a coordinator asks permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateAction {
    WriteTestFile,
    DispatchPlanner,
    RunTest,
    RetryAfterFailures,
}

impl GateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteTestFile => "write-test-file",
            Self::DispatchPlanner => "dispatch-planner",
            Self::RunTest => "run-test",
            Self::RetryAfterFailures => "retry",
        }
    }
}

impl fmt::Display for GateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "write-test-file" | "write" => Ok(Self::WriteTestFile),
            "dispatch-planner" | "plan" => Ok(Self::DispatchPlanner),
            "run-test" | "run" => Ok(Self::RunTest),
            "retry" | "retry-after-failures" => Ok(Self::RetryAfterFailures),
            other => Err(format!("unknown gate action '{other}'")),
        }
    }
}

/// Gate verdict. `Block` always names the next call to make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block { reason: String, remediation: String },
}

impl Decision {
    pub fn block(reason: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self::Block {
            reason: reason.into(),
            remediation: remediation.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// The run log as seen by the gate.
#[derive(Debug, Clone, Copy)]
pub enum LogView<'a> {
    Missing,
    Records(&'a [StageRecord]),
    Unreadable(&'a str),
}

/// Snapshot consulted by [`decide`].
#[derive(Debug, Clone, Copy)]
pub struct GateInputs<'a> {
    pub feature: &'a str,
    pub log: LogView<'a>,
    pub bundle_exists: bool,
    pub missing_artifacts: &'a [String],
    pub same_category_failure_limit: u32,
}

pub fn decide(action: GateAction, inputs: &GateInputs<'_>) -> Decision {
    let feature = inputs.feature;
    let records = match inputs.log {
        LogView::Unreadable(err) => {
            return Decision::block(
                format!("run log for '{feature}' is unreadable: {err}"),
                format!(
                    "inspect .autoheal/runlogs/{feature}.md, then run `autoheal runlog validate {feature}`"
                ),
            );
        }
        LogView::Missing => None,
        LogView::Records(records) => Some(records),
    };

    match action {
        GateAction::WriteTestFile => decide_write(feature, records, inputs),
        GateAction::DispatchPlanner => decide_planner(feature, inputs),
        GateAction::RunTest => decide_run(feature, records),
        GateAction::RetryAfterFailures => {
            decide_retry(feature, records.unwrap_or(&[]), inputs.same_category_failure_limit)
        }
    }
}

fn decide_write(
    feature: &str,
    records: Option<&[StageRecord]>,
    inputs: &GateInputs<'_>,
) -> Decision {
    if inputs.bundle_exists {
        return Decision::Allow;
    }
    let records = records.unwrap_or(&[]);
    let missing: Vec<&str> = [StageKind::Analyze, StageKind::Research, StageKind::Plan]
        .into_iter()
        .filter(|kind| !records.iter().any(|r| r.kind == *kind))
        .map(|kind| kind.as_str())
        .collect();
    if missing.is_empty() {
        return Decision::Allow;
    }
    let next = missing[0].to_ascii_lowercase();
    Decision::block(
        format!(
            "cannot write a test for '{feature}': run log lacks {} and no context bundle exists",
            missing.join(", ")
        ),
        format!(
            "run `autoheal context build {feature}` or complete the pipeline starting with `autoheal runlog append {feature} {next}`"
        ),
    )
}

fn decide_planner(feature: &str, inputs: &GateInputs<'_>) -> Decision {
    if inputs.bundle_exists {
        return Decision::Allow;
    }
    Decision::block(
        format!(
            "cannot dispatch the planner for '{feature}': context bundle missing {}",
            inputs.missing_artifacts.join(", ")
        ),
        format!("run `autoheal context build {feature}`"),
    )
}

fn decide_run(feature: &str, records: Option<&[StageRecord]>) -> Decision {
    let Some(records) = records else {
        return Decision::block(
            format!("cannot run tests for '{feature}': no planning has been recorded"),
            format!("run `autoheal runlog append {feature} plan` after planning the test"),
        );
    };
    if let Some(terminal) = terminal_kind(records) {
        return Decision::block(
            format!("'{feature}' is closed by {terminal}"),
            format!(
                "run `autoheal runlog override {feature} run --outcome fail` to reopen it deliberately"
            ),
        );
    }
    Decision::Allow
}

fn decide_retry(feature: &str, records: &[StageRecord], limit: u32) -> Decision {
    let Some((category, nth_index)) = nth_consecutive_failure(records, limit) else {
        return Decision::Allow;
    };
    let researched = records[nth_index + 1..]
        .iter()
        .any(|r| matches!(r.kind, StageKind::Research | StageKind::DeepAnalysis));
    if researched {
        return Decision::Allow;
    }
    Decision::block(
        format!(
            "'{feature}' failed {limit} consecutive times with {category} and no research was recorded since"
        ),
        format!(
            "gather evidence, then record it with `autoheal runlog append {feature} research`"
        ),
    )
}

/// Trailing streak of failed RUNs sharing one category.
///
/// Returns the category and the record index of the `limit`-th failure of the
/// streak when the streak is at least `limit` long.
pub fn nth_consecutive_failure(
    records: &[StageRecord],
    limit: u32,
) -> Option<(FailureCategory, usize)> {
    if limit == 0 {
        return None;
    }
    let runs: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.kind == StageKind::Run)
        .map(|(idx, _)| idx)
        .collect();
    let last = *runs.last()?;
    if !records[last].is_failed_run() {
        return None;
    }
    let category = category_of(&records[last]);
    let streak: Vec<usize> = runs
        .iter()
        .rev()
        .take_while(|idx| {
            let run = &records[**idx];
            run.is_failed_run() && category_of(run) == category
        })
        .copied()
        .collect();
    if (streak.len() as u32) < limit {
        return None;
    }
    // `streak` is newest-first; the limit-th failure counted from the oldest.
    let nth = streak[streak.len() - limit as usize];
    Some((category, nth))
}

fn category_of(record: &StageRecord) -> FailureCategory {
    record.category().unwrap_or(FailureCategory::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failed_run, fix, record};

    fn inputs<'a>(log: LogView<'a>, bundle_exists: bool) -> GateInputs<'a> {
        GateInputs {
            feature: "login",
            log,
            bundle_exists,
            missing_artifacts: &[],
            same_category_failure_limit: 3,
        }
    }

    fn remediation(decision: &Decision) -> &str {
        match decision {
            Decision::Block { remediation, .. } => remediation.as_str(),
            Decision::Allow => panic!("expected block"),
        }
    }

    #[test]
    fn write_blocks_without_plan_and_bundle() {
        let log = vec![
            record(StageKind::Analyze, None, None),
            record(StageKind::Research, None, None),
        ];
        let decision = decide(GateAction::WriteTestFile, &inputs(LogView::Records(&log), false));
        assert!(remediation(&decision).contains("autoheal runlog append login plan"));

        let mut log = log;
        log.push(record(StageKind::Plan, None, None));
        let decision = decide(GateAction::WriteTestFile, &inputs(LogView::Records(&log), false));
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn write_allows_with_bundle_and_no_log() {
        let decision = decide(GateAction::WriteTestFile, &inputs(LogView::Missing, true));
        assert!(decision.is_allow());
    }

    #[test]
    fn planner_requires_bundle() {
        let missing = vec!["codebase".to_string()];
        let gate = GateInputs {
            missing_artifacts: &missing,
            ..inputs(LogView::Missing, false)
        };
        let decision = decide(GateAction::DispatchPlanner, &gate);
        match &decision {
            Decision::Block { reason, remediation } => {
                assert!(reason.contains("codebase"));
                assert_eq!(remediation, "run `autoheal context build login`");
            }
            Decision::Allow => panic!("expected block"),
        }
    }

    #[test]
    fn run_requires_log_and_open_state() {
        let decision = decide(GateAction::RunTest, &inputs(LogView::Missing, true));
        assert!(!decision.is_allow());

        let log = vec![record(StageKind::Plan, None, None)];
        assert!(decide(GateAction::RunTest, &inputs(LogView::Records(&log), false)).is_allow());

        let closed = vec![
            record(StageKind::Plan, None, None),
            record(StageKind::Abandoned, None, None),
        ];
        let decision = decide(GateAction::RunTest, &inputs(LogView::Records(&closed), false));
        assert!(remediation(&decision).contains("override"));
    }

    #[test]
    fn unreadable_log_blocks_with_repair_step() {
        let decision = decide(
            GateAction::RunTest,
            &inputs(LogView::Unreadable("bad marker"), false),
        );
        assert!(remediation(&decision).contains("autoheal runlog validate login"));
    }

    #[test]
    fn retry_blocks_after_limit_same_category_failures() {
        let mut log = vec![
            failed_run(1, "x", "LOCATOR"),
            fix(1, "locator.role-based"),
            failed_run(2, "x", "LOCATOR"),
            fix(2, "locator.test-id"),
        ];
        assert!(
            decide(GateAction::RetryAfterFailures, &inputs(LogView::Records(&log), false))
                .is_allow()
        );

        log.push(failed_run(3, "x", "LOCATOR"));
        let decision =
            decide(GateAction::RetryAfterFailures, &inputs(LogView::Records(&log), false));
        assert!(remediation(&decision).contains("autoheal runlog append login research"));
        assert!(!remediation(&decision).contains("deep-analysis"));

        log.push(record(StageKind::Research, None, None));
        assert!(
            decide(GateAction::RetryAfterFailures, &inputs(LogView::Records(&log), false))
                .is_allow()
        );
    }

    #[test]
    fn research_before_the_nth_failure_does_not_count() {
        let log = vec![
            failed_run(1, "x", "WAIT"),
            record(StageKind::Research, None, None),
            failed_run(2, "x", "WAIT"),
            failed_run(3, "x", "WAIT"),
        ];
        let decision =
            decide(GateAction::RetryAfterFailures, &inputs(LogView::Records(&log), false));
        assert!(!decision.is_allow());
    }

    #[test]
    fn category_change_resets_the_streak() {
        let log = vec![
            failed_run(1, "x", "WAIT"),
            failed_run(2, "x", "WAIT"),
            failed_run(3, "x", "LOCATOR"),
        ];
        assert_eq!(nth_consecutive_failure(&log, 3), None);
        assert_eq!(
            nth_consecutive_failure(&log, 2),
            None,
            "only one trailing LOCATOR failure"
        );
        assert_eq!(
            nth_consecutive_failure(&log, 1),
            Some((FailureCategory::Locator, 2))
        );
    }

    #[test]
    fn decision_serializes_with_tag() {
        let json = serde_json::to_string(&Decision::block("r", "m")).expect("json");
        assert_eq!(json, r#"{"decision":"block","reason":"r","remediation":"m"}"#);
        let json = serde_json::to_string(&Decision::Allow).expect("json");
        assert_eq!(json, r#"{"decision":"allow"}"#);
    }

    #[test]
    fn parses_action_names() {
        assert_eq!(
            "write_test_file".parse::<GateAction>(),
            Ok(GateAction::WriteTestFile)
        );
        assert_eq!(
            "retry".parse::<GateAction>(),
            Ok(GateAction::RetryAfterFailures)
        );
        assert!("deploy".parse::<GateAction>().is_err());
    }
}
