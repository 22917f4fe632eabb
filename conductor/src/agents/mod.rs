//! Agent wrappers: one per kind of call the engine makes.
//!
//! Plan execution may edit the workspace. Blocker verification, recovery advice
//! and analysis are read-only advisory calls. Repair may edit one ledger file.

use std::path::Path;

pub mod analysis;
pub mod blocker;
pub mod plan_executor;
pub mod recovery;
pub mod repair;

/// Path as shown to the agent: relative to the workspace when possible.
pub(crate) fn display_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}
