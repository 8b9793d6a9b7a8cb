//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod decision;
pub mod heal_state;
pub mod hypotheses;
pub mod invariants;
pub mod types;
