//! Execution and recovery engine for an external coding agent.
//!
//! The engine walks a roadmap of phases and plans, launches the agent once per
//! attempt, classifies the streamed outcome and decides whether to advance,
//! retry or stop. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (stream parsing, classification,
//!   retry triage, scheduling, validation). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (ledger files, process execution,
//!   prompts, config). Isolated behind traits to enable scripted tests.
//! - **[`agents`]**: The individual agent calls: plan execution, blocker
//!   verification, recovery advice, record repair and post-run analysis.
//!
//! Orchestration modules ([`execute`], [`step`], [`looping`], [`select`],
//! [`validate`], [`heal`]) coordinate them to implement the CLI commands.

pub mod agents;
pub mod core;
pub mod error;
pub mod execute;
pub mod exit_codes;
pub mod heal;
pub mod io;
pub mod logging;
pub mod looping;
pub mod select;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
