//! Loop-terminating errors surfaced to the operator.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::plan_number::PlanId;
use crate::core::sentinel::SignalKind;
use crate::io::ledger::LedgerError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A verified failure sentinel.
    #[error("plan {plan} failed: {kind}{}", detail_suffix(detail))]
    HardFailure {
        plan: PlanId,
        kind: SignalKind,
        detail: String,
    },
    /// Soft failures hit the cap and the progress record did not move.
    #[error("plan {plan} is stuck: {attempts} soft failures (cap {max}) with no change in progress")]
    RetriesExhausted { plan: PlanId, attempts: u32, max: u32 },
    #[error("manual plan {plan} needs a human to finish it")]
    ManualPlanIncomplete { plan: PlanId },
    /// A plan already marked failed blocks the roadmap.
    #[error("plan {plan} is marked failed; fix it and reset its status to resume")]
    PlanFailed { plan: PlanId },
    #[error("{} is still invalid after {attempts} repair attempts", path.display())]
    HealExhausted { path: PathBuf, attempts: u32 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Plan named by the error, if any.
    pub fn plan(&self) -> Option<&PlanId> {
        match self {
            EngineError::HardFailure { plan, .. }
            | EngineError::RetriesExhausted { plan, .. }
            | EngineError::ManualPlanIncomplete { plan }
            | EngineError::PlanFailed { plan } => Some(plan),
            EngineError::HealExhausted { .. } | EngineError::Other(_) => None,
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Other(err) => EngineError::Other(err),
            invalid @ LedgerError::Invalid { .. } => EngineError::Other(anyhow::Error::new(invalid)),
        }
    }
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_plan() {
        let plan = PlanId::parse("02-03").expect("id");
        let err = EngineError::RetriesExhausted {
            plan: plan.clone(),
            attempts: 3,
            max: 3,
        };
        assert!(err.to_string().contains("02-03"));
        assert_eq!(err.plan(), Some(&plan));

        let err = EngineError::HardFailure {
            plan,
            kind: SignalKind::TestFailed,
            detail: "cargo test".to_string(),
        };
        assert_eq!(err.to_string(), "plan 02-03 failed: TEST_FAILED: cargo test");
    }
}
