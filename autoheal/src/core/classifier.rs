//! Deterministic classification of test failure text.
//!
//! Classification walks an ordered `(pattern, category)` table and returns the
//! category of the first rule whose pattern occurs in the failure text
//! (case-insensitive substring match). Text matching no rule is `UNKNOWN`.

use serde::{Deserialize, Serialize};

use crate::core::types::FailureCategory;

/// One entry of the classifier table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub pattern: String,
    pub category: FailureCategory,
}

impl ClassifierRule {
    pub fn new(pattern: &str, category: FailureCategory) -> Self {
        Self {
            pattern: pattern.to_string(),
            category,
        }
    }
}

/// Ordered rule table. Earlier rules win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classifier {
    rules: Vec<ClassifierRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl Classifier {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter(|rule| !rule.pattern.trim().is_empty())
            .map(|rule| ClassifierRule {
                pattern: rule.pattern.to_lowercase(),
                category: rule.category,
            })
            .collect();
        Self { rules }
    }

    /// Build from configured rules; an empty list selects the default table.
    pub fn from_config(rules: &[ClassifierRule]) -> Self {
        if rules.is_empty() {
            Self::default()
        } else {
            Self::new(rules.to_vec())
        }
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    pub fn classify(&self, error_text: &str) -> FailureCategory {
        let haystack = error_text.to_lowercase();
        self.rules
            .iter()
            .find(|rule| haystack.contains(&rule.pattern))
            .map(|rule| rule.category)
            .unwrap_or(FailureCategory::Unknown)
    }
}

/// Default table.
///
/// Auth and environment problems come first because their messages often also
/// mention timeouts or locators. Locator rules precede wait rules so that
/// "locator.click: Timeout 30000ms exceeded" lands on the selector, not the clock.
pub fn default_rules() -> Vec<ClassifierRule> {
    use FailureCategory::{Assertion, Auth, Env, Locator, Wait};

    [
        ("401 unauthorized", Auth),
        ("403 forbidden", Auth),
        ("unauthorized", Auth),
        ("forbidden", Auth),
        ("login failed", Auth),
        ("session expired", Auth),
        ("invalid credentials", Auth),
        ("storagestate", Auth),
        ("econnrefused", Env),
        ("enotfound", Env),
        ("net::err_", Env),
        ("connection refused", Env),
        ("browser has been closed", Env),
        ("executable doesn't exist", Env),
        ("missing environment variable", Env),
        ("base_url", Env),
        ("strict mode violation", Locator),
        ("resolved to 0 elements", Locator),
        ("element not found", Locator),
        ("no such element", Locator),
        ("not attached to the dom", Locator),
        ("locator.", Locator),
        ("getby", Locator),
        ("selector", Locator),
        ("timeout", Wait),
        ("timed out", Wait),
        ("waiting for", Wait),
        ("networkidle", Wait),
        ("expect(", Assertion),
        ("assertionerror", Assertion),
        ("expected", Assertion),
        ("received", Assertion),
        ("tohave", Assertion),
        ("tobe", Assertion),
    ]
    .into_iter()
    .map(|(pattern, category)| ClassifierRule::new(pattern, category))
    .collect()
}
