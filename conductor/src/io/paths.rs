//! On-disk layout of the plan ledger under `.planning/`.

use std::path::{Path, PathBuf};

use crate::core::plan_number::PlanId;

pub const PLANNING_DIR: &str = ".planning";

/// Resolved paths for one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPaths {
    root: PathBuf,
    planning: PathBuf,
}

impl LedgerPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            planning: root.join(PLANNING_DIR),
        }
    }

    /// Workspace the agent works in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn planning_dir(&self) -> &Path {
        &self.planning
    }

    pub fn roadmap(&self) -> PathBuf {
        self.planning.join("roadmap.json")
    }

    pub fn state(&self) -> PathBuf {
        self.planning.join("state.json")
    }

    pub fn config(&self) -> PathBuf {
        self.planning.join("config.toml")
    }

    pub fn phase_dir(&self, phase: u32) -> PathBuf {
        self.planning.join("phases").join(format!("{phase:02}"))
    }

    pub fn plan(&self, id: &PlanId) -> PathBuf {
        self.plan_file(id, "plan")
    }

    pub fn summary(&self, id: &PlanId) -> PathBuf {
        self.plan_file(id, "summary")
    }

    pub fn progress(&self, id: &PlanId) -> PathBuf {
        self.plan_file(id, "progress")
    }

    pub fn observations(&self, phase: u32) -> PathBuf {
        self.phase_dir(phase).join("observations.json")
    }

    pub fn iterations_dir(&self) -> PathBuf {
        self.planning.join("iterations")
    }

    pub fn iteration_dir(&self, iter: u32) -> PathBuf {
        self.iterations_dir().join(iter.to_string())
    }

    fn plan_file(&self, id: &PlanId, suffix: &str) -> PathBuf {
        self.phase_dir(id.phase)
            .join(format!("{}-{suffix}.json", id.stem()))
    }
}
