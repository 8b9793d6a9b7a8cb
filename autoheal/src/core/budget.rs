//! Shared time budget helpers for bounded waits.

use std::time::{Duration, Instant};

/// Remaining time until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

/// Exponential backoff step: doubles `current`, capped at `max`, never past the
/// remaining budget.
pub fn next_backoff(current: Duration, max: Duration, deadline: Instant) -> Option<Duration> {
    let remaining = remaining_budget(deadline)?;
    Some(current.saturating_mul(2).min(max).min(remaining))
}
