//! Multi-iteration scheduling loop for `conductor run`.

use tracing::{info, instrument, warn};

use crate::core::recovery::RetryBook;
use crate::error::EngineError;
use crate::execute::Engine;
use crate::io::agent::Agent;
use crate::io::guards::GateRunner;
use crate::step::{StepOutcome, StepReport, run_step};

/// Reason why `run_loop` stopped without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No incomplete plan remains.
    Complete,
    /// The iteration budget ran out; running again resumes where this stopped.
    MaxIterationsExceeded { max_iterations: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub steps_executed: u32,
    pub stop: LoopStop,
    /// Retry state at the time the loop stopped.
    pub retries: RetryBook,
}

/// Run iterations until the roadmap completes or the budget is spent.
///
/// `retries` carries per-plan retry state in and back out. Any
/// [`EngineError`] (verified hard failure, exhausted retries, a failed or
/// manual plan, an unrepairable record) stops the loop immediately.
#[instrument(skip_all, fields(max_iterations = engine.config().max_iterations))]
pub fn run_loop<A, G, F>(
    engine: &Engine<'_, A, G>,
    mut retries: RetryBook,
    mut on_step: F,
) -> Result<LoopOutcome, EngineError>
where
    A: Agent + ?Sized,
    G: GateRunner + ?Sized,
    F: FnMut(&StepReport),
{
    let max_iterations = engine.config().max_iterations;
    let mut steps_executed = 0u32;
    loop {
        if steps_executed >= max_iterations {
            warn!(steps_executed, "iteration budget exhausted");
            return Ok(LoopOutcome {
                steps_executed,
                stop: LoopStop::MaxIterationsExceeded { max_iterations },
                retries,
            });
        }
        match run_step(engine, &mut retries)? {
            StepOutcome::Complete => {
                info!(steps_executed, "all plans complete");
                return Ok(LoopOutcome {
                    steps_executed,
                    stop: LoopStop::Complete,
                    retries,
                });
            }
            StepOutcome::Ran(report) => {
                steps_executed += 1;
                on_step(&report);
            }
        }
    }
}
