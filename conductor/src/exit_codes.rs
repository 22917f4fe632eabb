//! Stable exit codes for conductor CLI commands.

/// Command succeeded, or `conductor next` selected a plan.
pub const OK: i32 = 0;
/// Invalid ledger/config or any other error.
pub const ERROR: i32 = 1;
/// `conductor next` found no incomplete plan.
pub const COMPLETE: i32 = 2;
/// A plan failed, got stuck or needs a human.
pub const HARD_FAILURE: i32 = 3;
/// `conductor run` spent its iteration budget with work remaining.
pub const BUDGET_EXHAUSTED: i32 = 4;
