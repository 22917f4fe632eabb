//! Selection helper for `conductor next`.
//!
//! Read-only: bundles the active phase still needs are synthesized in memory
//! so the answer matches what `conductor run` would pick, but nothing is written.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::core::plan_number::PlanId;
use crate::core::schedule::{NextPlan, insert_plans, next_plan, pending_bundles};
use crate::io::ledger::Ledger;
use crate::io::paths::LedgerPaths;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Every plan is complete.
    Complete,
    Next(PlanId),
    /// A failed plan blocks the roadmap.
    Failed(PlanId),
}

/// Load the ledger under `root` and select the next plan.
pub fn select_from_root(root: &Path) -> Result<SelectOutcome> {
    let ledger = Ledger::new(LedgerPaths::new(root));
    let roadmap = ledger.load_roadmap().context("load roadmap for selection")?;
    let mut phases = ledger
        .load_all_phases(&roadmap)
        .context("load plans for selection")?;
    let mut blockers = BTreeMap::new();
    for phase in &phases {
        blockers.insert(phase.number, ledger.open_blockers(phase.number)?);
    }
    let bundles = pending_bundles(
        &phases,
        |phase| blockers.get(&phase).cloned().unwrap_or_default(),
        Utc::now(),
    );
    insert_plans(&mut phases, bundles);
    Ok(match next_plan(&phases) {
        NextPlan::Complete => SelectOutcome::Complete,
        NextPlan::Run(id) => SelectOutcome::Next(id),
        NextPlan::Failed(id) => SelectOutcome::Failed(id),
    })
}
