//! Gate engine: loads persisted state and applies the decision rules.
//!
//! `evaluate` is read-only and infallible. Anything that goes wrong while
//! loading state becomes a BLOCK whose remediation names the repair step.

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::decision::{Decision, GateAction, GateInputs, LogView, decide};
use crate::io::context::ContextCache;
use crate::io::paths::validate_id;
use crate::io::run_log::RunLogStore;
use crate::io::session::SessionStore;

/// One-time guidance attached to an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub category: &'static str,
    pub text: String,
}

pub struct GateEngine<'a> {
    pub run_logs: &'a RunLogStore,
    pub context: &'a ContextCache,
    pub sessions: &'a SessionStore,
    pub same_category_failure_limit: u32,
}

impl GateEngine<'_> {
    #[instrument(skip(self), fields(action = %action))]
    pub fn evaluate(&self, action: GateAction, feature: &str) -> Decision {
        if let Err(err) = validate_id("feature", feature) {
            return Decision::block(
                err.to_string(),
                "pass a feature id made of letters, digits, '.', '_' or '-'",
            );
        }

        let loaded = self.run_logs.read_optional(feature);
        let load_error: String;
        let log = match &loaded {
            Ok(Some(records)) => LogView::Records(records),
            Ok(None) => LogView::Missing,
            Err(err) => {
                warn!(feature, err = %err, "run log unreadable");
                load_error = err.to_string();
                LogView::Unreadable(&load_error)
            }
        };

        let missing_artifacts = match self.context.missing_artifacts(feature) {
            Ok(missing) => missing,
            Err(err) => {
                warn!(feature, err = %err, "context bundle unreadable");
                vec![format!("(unreadable: {err})")]
            }
        };

        let decision = decide(
            action,
            &GateInputs {
                feature,
                log,
                bundle_exists: missing_artifacts.is_empty(),
                missing_artifacts: &missing_artifacts,
                same_category_failure_limit: self.same_category_failure_limit,
            },
        );
        debug!(feature, allow = decision.is_allow(), "gate decided");
        decision
    }

    /// Hint for `action` this session has not seen yet. Read-only.
    pub fn pending_hint(
        &self,
        action: GateAction,
        feature: &str,
        session_id: &str,
    ) -> Result<Option<Hint>> {
        let hint = hint_for(action, feature);
        if self.sessions.hint_delivered(session_id, hint.category)? {
            return Ok(None);
        }
        Ok(Some(hint))
    }

    /// Return the pending hint (if any) and mark it delivered.
    pub fn deliver_hint(
        &self,
        action: GateAction,
        feature: &str,
        session_id: &str,
    ) -> Result<Option<Hint>> {
        let Some(hint) = self.pending_hint(action, feature, session_id)? else {
            return Ok(None);
        };
        self.sessions.mark_hint_delivered(session_id, hint.category)?;
        Ok(Some(hint))
    }
}

pub fn hint_for(action: GateAction, feature: &str) -> Hint {
    match action {
        GateAction::WriteTestFile => Hint {
            category: "test-authoring",
            text: format!(
                "Reuse the selectors and fixtures in .autoheal/context/{feature}/patterns.md; prefer role-based locators and web-first assertions."
            ),
        },
        GateAction::DispatchPlanner => Hint {
            category: "planning",
            text: format!(
                "Hand the planner .autoheal/context/{feature}/ and keep the plan to observable user steps."
            ),
        },
        GateAction::RunTest => Hint {
            category: "test-execution",
            text: format!(
                "Let `autoheal heal {feature}` drive runs and fixes, or record each run with `autoheal runlog append {feature} run --outcome pass|fail`."
            ),
        },
        GateAction::RetryAfterFailures => Hint {
            category: "retry-discipline",
            text: "Repeated failures in one category need fresh research before another fix."
                .to_string(),
        },
    }
}
