//! Execute a single scheduling iteration.
//!
//! Loads the ledger (healing invalid records), synthesizes any bundle plans
//! the active phase needs, selects the next plan, attempts it once and writes
//! the verdict back to the ledger and the iteration log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::observation::ObservationBody;
use crate::core::plan_number::PlanId;
use crate::core::records::{Bundle, Plan, Roadmap, Status};
use crate::core::recovery::{RetryBook, RetryGate, SoftResolution, TriageInput, resolve_soft};
use crate::core::schedule::{
    NextPlan, PhasePlans, derive_phase_status, insert_plans, mark_complete, mark_failed,
    next_plan, pending_bundles,
};
use crate::core::types::{Outcome, RunResult, SoftFailure, SoftKind};
use crate::error::EngineError;
use crate::execute::{Engine, plan_id};
use crate::io::agent::Agent;
use crate::io::guards::GateRunner;
use crate::io::iteration_log::{IterationMeta, IterationPaths, write_meta};

/// What happened to the plan after its attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    /// Soft failure recorded; the plan is selected again next iteration.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub iter: u32,
    pub plan: PlanId,
    pub outcome: Outcome,
    pub resolution: Resolution,
    /// Soft failures recorded for the plan after this iteration.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Every plan of every phase is complete.
    Complete,
    Ran(StepReport),
}

/// Run one iteration against the workspace behind `engine`.
///
/// `retries` is the loop's retry state; it is read before the attempt and
/// updated with the verdict.
#[instrument(skip_all)]
pub fn run_step<A, G>(
    engine: &Engine<'_, A, G>,
    retries: &mut RetryBook,
) -> Result<StepOutcome, EngineError>
where
    A: Agent + ?Sized,
    G: GateRunner + ?Sized,
{
    let ledger = engine.ledger();
    let mut state = engine.load_healed(None, || ledger.load_state())?;
    let iter = state.last_iteration + 1;
    let paths = IterationPaths::new(ledger.paths().iteration_dir(iter));
    let heal_dir = Some(paths.dir.as_path());

    let mut roadmap = engine.load_healed(heal_dir, || ledger.load_roadmap())?;
    let mut phases = engine.load_healed(heal_dir, || ledger.load_all_phases(&roadmap))?;
    synthesize_bundles(engine, &mut roadmap, &mut phases)?;

    let id = match next_plan(&phases) {
        NextPlan::Complete => {
            sync_phase_statuses(engine, &mut roadmap, &phases)?;
            info!("roadmap complete");
            return Ok(StepOutcome::Complete);
        }
        NextPlan::Failed(id) => return Err(EngineError::PlanFailed { plan: id }),
        NextPlan::Run(id) => id,
    };

    let cap = engine.config().retry_cap();
    let progress = ledger.progress_text(&id)?;
    match retries.gate(&id, progress.as_deref(), cap) {
        RetryGate::Proceed => {}
        RetryGate::ProgressReset { previous_attempts } => {
            info!(plan = %id, previous_attempts, "progress moved since the last attempt; retry counter reset");
        }
        RetryGate::Exhausted { attempts, max } => {
            warn!(plan = %id, attempts, max, "no progress after exhausting retries");
            return Err(EngineError::RetriesExhausted {
                plan: id,
                attempts,
                max,
            });
        }
    }

    let mut plan = find_plan(&phases, &id)?;
    if plan.status == Status::Pending {
        plan.status = Status::InProgress;
        ledger.save_plan(&plan)?;
        replace_plan(&mut phases, &plan);
    }
    if state.current_phase != Some(id.phase) {
        info!(phase = id.phase, "entering phase");
    }
    let started_at = Utc::now();
    state.current_phase = Some(id.phase);
    state.current_plan = Some(id.to_string());
    state.last_iteration = iter;
    state.updated_at = Some(started_at);
    ledger.save_state(&state)?;
    sync_phase_statuses(engine, &mut roadmap, &phases)?;

    info!(iter, plan = %id, attempts = retries.attempts(&id), "attempting plan");
    let result = engine.attempt(&plan, retries.guidance(&id), iter)?;
    let applied = apply_outcome(engine, retries, &mut plan, &id, &result, progress);
    replace_plan(&mut phases, &plan);

    let mut meta = iteration_meta(iter, &id, &result, retries.attempts(&id), started_at);
    if let Err(err) = &applied {
        meta.error.get_or_insert_with(|| err.to_string());
    }
    write_meta(&paths, &meta)?;
    let resolution = applied?;

    if resolution == Resolution::Completed {
        state.completed_plans += 1;
    }
    state.updated_at = Some(Utc::now());
    ledger.save_state(&state)?;
    sync_phase_statuses(engine, &mut roadmap, &phases)?;

    Ok(StepOutcome::Ran(StepReport {
        iter,
        plan: id.clone(),
        outcome: result.outcome,
        resolution,
        attempts: retries.attempts(&id),
    }))
}

/// Persist the bundles the active phase needs and add them to the roadmap.
///
/// A bundle whose file already exists is loaded rather than overwritten.
fn synthesize_bundles<A, G>(
    engine: &Engine<'_, A, G>,
    roadmap: &mut Roadmap,
    phases: &mut [PhasePlans],
) -> Result<(), EngineError>
where
    A: Agent + ?Sized,
    G: GateRunner + ?Sized,
{
    let ledger = engine.ledger();
    let mut blockers: BTreeMap<u32, Vec<ObservationBody>> = BTreeMap::new();
    for phase in phases.iter() {
        let open = engine.load_healed(None, || ledger.open_blockers(phase.number))?;
        blockers.insert(phase.number, open);
    }
    let bundles = pending_bundles(
        phases,
        |phase| blockers.get(&phase).cloned().unwrap_or_default(),
        Utc::now(),
    );
    if bundles.is_empty() {
        return Ok(());
    }

    let mut inserted = Vec::with_capacity(bundles.len());
    for bundle in bundles {
        let id = plan_id(&bundle)?;
        let plan = if ledger.paths().plan(&id).exists() {
            engine.load_healed(None, || ledger.load_plan(&id))?
        } else {
            ledger.save_plan(&bundle)?;
            info!(
                plan = %id,
                bundle = bundle.bundle.map_or("plan", |kind| kind.label()),
                tasks = bundle.tasks.len(),
                "synthesized bundle plan"
            );
            bundle
        };
        let open = blockers.get(&id.phase).map_or(0, Vec::len);
        if plan.bundle == Some(Bundle::Verification) && open > 0 {
            warn!(phase = id.phase, open, "open blockers carried into the phase's verification");
        }
        if let Some(phase) = roadmap.phase_mut(id.phase) {
            let raw = id.to_string();
            if !phase.plans.contains(&raw) {
                phase.plans.push(raw);
            }
        }
        inserted.push(plan);
    }
    engine.ledger().save_roadmap(roadmap)?;
    insert_plans(phases, inserted);
    Ok(())
}

fn apply_outcome<A, G>(
    engine: &Engine<'_, A, G>,
    retries: &mut RetryBook,
    plan: &mut Plan,
    id: &PlanId,
    result: &RunResult,
    progress_before: Option<String>,
) -> Result<Resolution, EngineError>
where
    A: Agent + ?Sized,
    G: GateRunner + ?Sized,
{
    let ledger = engine.ledger();
    let now = Utc::now();
    match &result.outcome {
        Outcome::Success => {
            complete_plan(engine, plan, id, now)?;
            retries.clear(id);
            info!(plan = %id, "plan complete");
            Ok(Resolution::Completed)
        }
        Outcome::Hard(failure) => {
            mark_failed(plan, now);
            ledger.save_plan(plan)?;
            warn!(plan = %id, kind = %failure.kind, detail = %failure.detail, "hard failure");
            Err(EngineError::HardFailure {
                plan: id.clone(),
                kind: failure.kind,
                detail: failure.detail.clone(),
            })
        }
        Outcome::Soft(failure) => {
            let progress = ledger.progress(id);
            let input = TriageInput {
                summary_exists: counts_summary(failure) && ledger.has_valid_summary(id),
                progress: progress.as_ref(),
                last_output: &result.last_output,
            };
            let cap = engine.config().retry_cap();
            let attempt = retries.attempts(id) + 1;
            match resolve_soft(&input, failure, attempt, cap) {
                SoftResolution::MarkComplete => {
                    info!(plan = %id, reason = failure.kind.reason(), "summary on disk; treating plan as complete");
                    complete_plan(engine, plan, id, now)?;
                    retries.clear(id);
                    Ok(Resolution::Completed)
                }
                SoftResolution::Retry { .. } if plan.is_manual_only() => {
                    warn!(plan = %id, reason = failure.kind.reason(), "manual plan not finished");
                    Err(EngineError::ManualPlanIncomplete { plan: id.clone() })
                }
                SoftResolution::Retry { guidance } => {
                    let progress_text = ledger.progress_text(id)?;
                    let attempts = retries.record_soft_failure(
                        id,
                        progress_before,
                        progress_text,
                        &result.last_output,
                        Some(guidance),
                    );
                    info!(plan = %id, attempts, cap, reason = failure.kind.reason(), "soft failure; plan will be retried");
                    Ok(Resolution::Retry)
                }
            }
        }
    }
}

/// A failed validation gate means the summary on disk is not proof of completion.
fn counts_summary(failure: &SoftFailure) -> bool {
    failure.kind != SoftKind::ValidationFailed
}

fn complete_plan<A, G>(
    engine: &Engine<'_, A, G>,
    plan: &mut Plan,
    id: &PlanId,
    now: DateTime<Utc>,
) -> Result<(), EngineError>
where
    A: Agent + ?Sized,
    G: GateRunner + ?Sized,
{
    let progress = engine.ledger().progress(id);
    mark_complete(plan, progress.as_ref(), now);
    engine.ledger().save_plan(plan)?;
    Ok(())
}

fn find_plan(phases: &[PhasePlans], id: &PlanId) -> Result<Plan, EngineError> {
    phases
        .iter()
        .filter(|phase| phase.number == id.phase)
        .flat_map(|phase| phase.plans.iter())
        .find(|plan| plan.id().as_ref() == Some(id))
        .cloned()
        .ok_or_else(|| EngineError::Other(anyhow::anyhow!("selected plan {id} not loaded")))
}

fn replace_plan(phases: &mut [PhasePlans], plan: &Plan) {
    let id = plan.id();
    for phase in phases.iter_mut().filter(|phase| phase.number == plan.phase) {
        for slot in phase.plans.iter_mut().filter(|slot| slot.id() == id) {
            *slot = plan.clone();
        }
    }
}

/// Write derived phase statuses into the roadmap when they changed.
fn sync_phase_statuses<A, G>(
    engine: &Engine<'_, A, G>,
    roadmap: &mut Roadmap,
    phases: &[PhasePlans],
) -> Result<(), EngineError>
where
    A: Agent + ?Sized,
    G: GateRunner + ?Sized,
{
    let mut changed = false;
    for phase in phases {
        let status = derive_phase_status(&phase.plans);
        if let Some(entry) = roadmap.phase_mut(phase.number) {
            if entry.status != status {
                entry.status = status;
                changed = true;
            }
        }
    }
    if changed {
        engine.ledger().save_roadmap(roadmap)?;
    }
    Ok(())
}

fn iteration_meta(
    iter: u32,
    id: &PlanId,
    result: &RunResult,
    attempts: u32,
    started_at: DateTime<Utc>,
) -> IterationMeta {
    IterationMeta {
        iter,
        plan: id.to_string(),
        outcome: result.outcome.label(),
        failure_class: result.failure_class(),
        attempts,
        started_at: Some(started_at.to_rfc3339()),
        duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
        usage: result.usage,
        error: result.error.clone(),
    }
}
