//! Side-effecting stores and collaborators: filesystem state, locks, child processes.

pub mod config;
pub mod context;
pub mod hooks;
pub mod incident;
pub mod lock;
pub mod paths;
pub mod process;
pub mod run_log;
pub mod session;
pub mod test_runner;
pub mod worker;
