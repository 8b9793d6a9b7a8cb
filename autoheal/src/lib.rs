//! Workflow enforcement and autonomous retry for AI-assisted end-to-end test authoring.
//!
//! The engine keeps every piece of continuity on disk under `.autoheal/`, so
//! any invocation (a hook, a CLI call, a restarted heal loop) can pick up
//! where the last one stopped:
//!
//! - **[`core`]**: Pure, deterministic logic (stage model, invariants, gate rules,
//!   classification, hypothesis selection, heal-state derivation). No I/O.
//! - **[`io`]**: Side-effecting stores and collaborators (run logs, sessions,
//!   context bundles, named locks, child processes).
//!
//! Orchestration modules ([`gate`], [`builder`], [`heal`]) combine the two to
//! implement the CLI commands.

pub mod builder;
pub mod core;
pub mod exit_codes;
pub mod gate;
pub mod heal;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
