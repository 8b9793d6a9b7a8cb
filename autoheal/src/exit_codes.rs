//! Stable exit codes for `autoheal` commands.

/// Command succeeded, gate allowed, or the heal loop reached SUCCESS.
pub const OK: i32 = 0;
/// Invalid input, configuration, corrupt state or any other fatal error.
pub const ERROR: i32 = 1;
/// Gate blocked the action; the remediation is on stderr.
pub const BLOCKED: i32 = 2;
/// Heal loop exhausted its attempt budget.
pub const ABANDONED: i32 = 3;
/// The test runner could not run; an incident report was written.
pub const INFRASTRUCTURE: i32 = 4;
/// A named lock stayed busy past its timeout; retrying may succeed.
pub const CONTENTION: i32 = 5;
