//! Fix hypothesis catalogue and no-repeat selection.

use std::collections::BTreeSet;

use crate::core::types::FailureCategory;

/// A canned fix strategy for a failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hypothesis {
    pub id: &'static str,
    pub summary: &'static str,
}

const LOCATOR: &[Hypothesis] = &[
    Hypothesis {
        id: "locator.role-based",
        summary: "replace the failing selector with a role + accessible-name locator",
    },
    Hypothesis {
        id: "locator.test-id",
        summary: "target the element through a data-testid attribute",
    },
    Hypothesis {
        id: "locator.scoped-container",
        summary: "scope the locator to its nearest stable container",
    },
    Hypothesis {
        id: "locator.text-exact",
        summary: "match on exact visible text instead of a partial match",
    },
    Hypothesis {
        id: "locator.first-visible",
        summary: "disambiguate multiple matches by filtering to the visible element",
    },
];

const WAIT: &[Hypothesis] = &[
    Hypothesis {
        id: "wait.visible-before-action",
        summary: "await visibility of the target before interacting",
    },
    Hypothesis {
        id: "wait.response",
        summary: "await the backing network response instead of a fixed delay",
    },
    Hypothesis {
        id: "wait.url-change",
        summary: "await navigation to the expected URL",
    },
    Hypothesis {
        id: "wait.load-state",
        summary: "await the page load state before continuing",
    },
];

const ASSERTION: &[Hypothesis] = &[
    Hypothesis {
        id: "assertion.observed-value",
        summary: "align the expectation with the value the application renders",
    },
    Hypothesis {
        id: "assertion.retrying-matcher",
        summary: "use a web-first retrying matcher instead of a one-shot read",
    },
    Hypothesis {
        id: "assertion.normalize-text",
        summary: "normalize whitespace and casing before comparing text",
    },
];

const AUTH: &[Hypothesis] = &[
    Hypothesis {
        id: "auth.refresh-storage-state",
        summary: "regenerate the stored authenticated session state",
    },
    Hypothesis {
        id: "auth.login-fixture",
        summary: "log in through the shared fixture instead of inline steps",
    },
];

const ENV: &[Hypothesis] = &[
    Hypothesis {
        id: "env.base-url",
        summary: "resolve the target URL from the configured base URL",
    },
    Hypothesis {
        id: "env.service-readiness",
        summary: "wait for the dependent service health check before the test",
    },
];

/// Canned hypotheses for a category, in preference order.
pub fn candidates(category: FailureCategory) -> &'static [Hypothesis] {
    match category {
        FailureCategory::Locator => LOCATOR,
        FailureCategory::Wait => WAIT,
        FailureCategory::Assertion => ASSERTION,
        FailureCategory::Auth => AUTH,
        FailureCategory::Env => ENV,
        FailureCategory::Unknown => &[],
    }
}

/// Hypothesis chosen for the next FIX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub id: String,
    pub summary: String,
    /// True when no canned hypothesis applied and the fixer must re-diagnose.
    pub rediagnose: bool,
}

/// Hypothesis ids are `[A-Za-z0-9._-]+`; they appear in run-log headings.
pub fn is_valid_hypothesis_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Id of the generic re-diagnose strategy for an attempt (unique per attempt).
pub fn rediagnose_id(attempt: u32) -> String {
    format!("rediagnose-{attempt}")
}

/// Pick the next hypothesis that has not been tried for this feature.
///
/// `suggested` (from deep-analysis evidence) is preferred when it is a well-formed
/// id that has not been tried. Falls back
/// to re-diagnose for `UNKNOWN` or an exhausted category.
pub fn select(
    category: FailureCategory,
    tried: &BTreeSet<String>,
    suggested: Option<&str>,
    attempt: u32,
) -> Selection {
    if let Some(id) = suggested.map(str::trim).filter(|id| is_valid_hypothesis_id(id))
        && !tried.contains(id)
    {
        let summary = find(id)
            .map(|h| h.summary.to_string())
            .unwrap_or_else(|| "apply the strategy suggested by deep analysis".to_string());
        return Selection {
            id: id.to_string(),
            summary,
            rediagnose: false,
        };
    }

    if let Some(next) = candidates(category)
        .iter()
        .find(|candidate| !tried.contains(candidate.id))
    {
        return Selection {
            id: next.id.to_string(),
            summary: next.summary.to_string(),
            rediagnose: false,
        };
    }

    let mut id = rediagnose_id(attempt);
    let mut suffix = 1u32;
    while tried.contains(&id) {
        suffix += 1;
        id = format!("{}.{suffix}", rediagnose_id(attempt));
    }
    Selection {
        id,
        summary: "re-read the failure and application state and derive a fresh fix".to_string(),
        rediagnose: true,
    }
}

fn find(id: &str) -> Option<&'static Hypothesis> {
    [LOCATOR, WAIT, ASSERTION, AUTH, ENV]
        .into_iter()
        .flatten()
        .find(|h| h.id == id)
}
