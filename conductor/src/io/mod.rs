//! I/O helpers for engine commands.

pub mod agent;
pub mod atomic;
pub mod config;
pub mod guards;
pub mod iteration_log;
pub mod ledger;
pub mod paths;
pub mod process;
pub mod prompt;
