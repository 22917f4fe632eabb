//! Soft-failure triage and per-plan retry bookkeeping.
//!
//! Retry state is an explicit value owned by the scheduling loop and threaded
//! through each iteration; nothing here is global.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::plan_number::PlanId;
use crate::core::records::ProgressRecord;
use crate::core::types::SoftFailure;

static HUMAN_ACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)human[-_ ]action|manual task|checkpoint:\s*human")
        .expect("human action regex is valid")
});

/// Facts the triage heuristics look at.
#[derive(Debug, Clone, Copy)]
pub struct TriageInput<'a> {
    pub summary_exists: bool,
    pub progress: Option<&'a ProgressRecord>,
    pub last_output: &'a str,
}

/// Heuristic chosen for a soft failure, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Triage {
    /// The summary exists, so the work is done despite the missing signal.
    MarkComplete,
    /// Every task is recorded complete; only the wrap-up is missing.
    Finalize,
    /// The agent stalled on a human-action task.
    SkipManual,
    Generic,
}

pub fn triage(input: &TriageInput<'_>) -> Triage {
    if input.summary_exists {
        return Triage::MarkComplete;
    }
    if input
        .progress
        .is_some_and(ProgressRecord::all_tasks_complete)
    {
        return Triage::Finalize;
    }
    if HUMAN_ACTION_RE.is_match(input.last_output) {
        return Triage::SkipManual;
    }
    Triage::Generic
}

/// What to do with a soft failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoftResolution {
    MarkComplete,
    Retry { guidance: String },
}

/// Turn a soft failure into a resolution with guidance for the next attempt.
///
/// `attempt` is the number of soft failures recorded so far for the plan,
/// including this one.
pub fn resolve_soft(
    input: &TriageInput<'_>,
    failure: &SoftFailure,
    attempt: u32,
    max_attempts: u32,
) -> SoftResolution {
    let heuristic = triage(input);
    if heuristic == Triage::MarkComplete {
        return SoftResolution::MarkComplete;
    }

    let mut guidance = format!(
        "Previous attempt {attempt} of {max_attempts} ended with: {}.\n",
        failure.kind.reason()
    );
    guidance.push_str(match heuristic {
        Triage::Finalize => {
            "Every task in the progress record is complete. Do not redo the work: \
             write the summary record for this plan and emit ###PLAN_COMPLETE###."
        }
        Triage::SkipManual => {
            "Manual (human-action) tasks are deferred to the phase's manual plan. \
             Mark them deferred in the progress record, finish the remaining automated \
             tasks, then write the summary and emit ###PLAN_COMPLETE###."
        }
        Triage::Generic | Triage::MarkComplete => {
            "Record progress in the progress file as you go, diagnose why the previous \
             attempt stopped, and proceed carefully from where it left off."
        }
    });
    if attempt + 1 >= max_attempts {
        guidance.push_str(
            "\nThis is the last retry: if the plan cannot be finished, emit a failure sentinel \
             with a precise reason instead of stopping silently.",
        );
    }
    if let Some(extra) = failure.guidance.as_deref().filter(|g| !g.trim().is_empty()) {
        guidance.push_str("\n\n");
        guidance.push_str(extra.trim());
    }
    SoftResolution::Retry { guidance }
}

/// Retry bookkeeping for one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanRetryState {
    pub attempts: u32,
    /// Progress record text when the latest failed attempt started.
    pub progress_before: Option<String>,
    /// Progress record text captured at the end of the latest failed attempt.
    pub last_progress: Option<String>,
    pub last_output: String,
    /// Guidance to inject into the next attempt.
    pub guidance: Option<String>,
}

/// Gate evaluated before re-attempting a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryGate {
    Proceed,
    /// Attempts were exhausted but the progress text moved, so the counter restarts.
    ProgressReset { previous_attempts: u32 },
    Exhausted { attempts: u32, max: u32 },
}

/// Per-plan retry state for one loop run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryBook {
    plans: BTreeMap<PlanId, PlanRetryState>,
}

impl RetryBook {
    pub fn get(&self, id: &PlanId) -> Option<&PlanRetryState> {
        self.plans.get(id)
    }

    pub fn attempts(&self, id: &PlanId) -> u32 {
        self.plans.get(id).map_or(0, |state| state.attempts)
    }

    pub fn guidance(&self, id: &PlanId) -> Option<&str> {
        self.plans.get(id).and_then(|state| state.guidance.as_deref())
    }

    /// Decide whether an exhausted plan may run again.
    ///
    /// The plan is stuck when its latest attempt left the progress text
    /// byte-identical and nothing has changed it since. Any movement restarts
    /// the counter.
    pub fn gate(&mut self, id: &PlanId, current_progress: Option<&str>, max: u32) -> RetryGate {
        let Some(state) = self.plans.get_mut(id) else {
            return RetryGate::Proceed;
        };
        if state.attempts < max {
            return RetryGate::Proceed;
        }
        let unchanged = state.last_progress.as_deref() == current_progress
            && state.progress_before == state.last_progress;
        if unchanged {
            return RetryGate::Exhausted {
                attempts: state.attempts,
                max,
            };
        }
        let previous_attempts = state.attempts;
        state.attempts = 0;
        RetryGate::ProgressReset { previous_attempts }
    }

    /// Count a soft failure and return the new attempt count.
    ///
    /// `before` and `after` are the progress texts at the start and end of the attempt.
    pub fn record_soft_failure(
        &mut self,
        id: &PlanId,
        before: Option<String>,
        after: Option<String>,
        last_output: &str,
        guidance: Option<String>,
    ) -> u32 {
        let state = self.plans.entry(id.clone()).or_default();
        state.attempts += 1;
        state.progress_before = before;
        state.last_progress = after;
        state.last_output = last_output.to_string();
        state.guidance = guidance;
        state.attempts
    }

    /// Forget a plan once it completes.
    pub fn clear(&mut self, id: &PlanId) {
        self.plans.remove(id);
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
