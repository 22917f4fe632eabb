//! Deterministic scheduling over the plan ledger.
//!
//! Plans run by roadmap order: phase ascending, then plan number ascending. Two
//! bands are reserved inside a phase. The decisions plan (`00`) bundles
//! decision-checkpoint tasks and runs first. The manual plan (`99`) and the
//! verification plan (`100`) bundle human-action and review work and run after
//! every ordinary plan of the phase is complete.

use chrono::{DateTime, Utc};

use crate::core::observation::ObservationBody;
use crate::core::plan_number::{PlanId, PlanNumber};
use crate::core::records::{
    Bundle, Checkpoint, Plan, ProgressRecord, Status, Task, TaskStatus, TaskType,
};

/// All plans of one phase, as loaded from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlans {
    pub number: u32,
    pub plans: Vec<Plan>,
}

impl PhasePlans {
    pub fn new(number: u32, mut plans: Vec<Plan>) -> Self {
        plans.sort_by_key(|plan| plan.number());
        Self { number, plans }
    }

    fn has_plan(&self, number: &str) -> bool {
        let Some(wanted) = PlanNumber::parse(number) else {
            return false;
        };
        self.plans
            .iter()
            .any(|plan| plan.number().as_ref() == Some(&wanted))
    }

    fn ordinary(&self) -> impl Iterator<Item = &Plan> {
        self.plans
            .iter()
            .filter(|plan| plan.number().is_some_and(|n| n.is_ordinary()))
    }

    /// Every ordinary plan, and the decisions plan if present, is complete.
    pub fn ordinary_complete(&self) -> bool {
        self.plans
            .iter()
            .filter(|plan| plan.number().is_none_or(|n| !n.is_late_band()))
            .all(|plan| plan.status == Status::Complete)
    }

    pub fn is_complete(&self) -> bool {
        self.plans.iter().all(|plan| plan.status == Status::Complete)
    }
}

/// Scheduler decision over the whole ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPlan {
    /// No incomplete plan remains.
    Complete,
    Run(PlanId),
    /// The first incomplete plan in order is already marked failed.
    Failed(PlanId),
}

/// First plan that is not complete, by phase then plan number.
pub fn next_plan(phases: &[PhasePlans]) -> NextPlan {
    let mut ordered: Vec<&PhasePlans> = phases.iter().collect();
    ordered.sort_by_key(|phase| phase.number);
    for phase in ordered {
        for plan in &phase.plans {
            let Some(id) = plan.id() else {
                continue;
            };
            match plan.status {
                Status::Complete => {}
                Status::Failed => return NextPlan::Failed(id),
                Status::Pending | Status::InProgress => return NextPlan::Run(id),
            }
        }
    }
    NextPlan::Complete
}

/// First phase that still has work, counting bundles not yet synthesized.
pub fn active_phase<'a>(
    phases: &'a [PhasePlans],
    open_blockers: impl Fn(u32) -> Vec<ObservationBody>,
) -> Option<&'a PhasePlans> {
    let mut ordered: Vec<&PhasePlans> = phases.iter().collect();
    ordered.sort_by_key(|phase| phase.number);
    ordered.into_iter().find(|phase| {
        !phase.is_complete() || !late_bundles(phase, &open_blockers(phase.number), epoch()).is_empty()
    })
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Bundles the active phase needs before its next plan can be selected.
pub fn pending_bundles(
    phases: &[PhasePlans],
    open_blockers: impl Fn(u32) -> Vec<ObservationBody>,
    now: DateTime<Utc>,
) -> Vec<Plan> {
    let Some(phase) = active_phase(phases, &open_blockers) else {
        return Vec::new();
    };
    let mut bundles: Vec<Plan> = decisions_bundle(phase, now).into_iter().collect();
    bundles.extend(late_bundles(phase, &open_blockers(phase.number), now));
    bundles
}

/// Insert synthesized plans into their phases, keeping plan order.
pub fn insert_plans(phases: &mut [PhasePlans], plans: Vec<Plan>) {
    for plan in plans {
        if let Some(phase) = phases.iter_mut().find(|phase| phase.number == plan.phase) {
            phase.plans.push(plan);
            phase.plans.sort_by_key(|plan| plan.number());
        }
    }
}

/// Decisions plan for a phase being entered, if it has pending decision checkpoints.
pub fn decisions_bundle(phase: &PhasePlans, now: DateTime<Utc>) -> Option<Plan> {
    if phase.has_plan(Bundle::Decisions.plan_number()) {
        return None;
    }
    let tasks = collect_tasks(phase, |plan, task| {
        plan.status != Status::Complete && task.checkpoint == Some(Checkpoint::Decision)
    });
    if tasks.is_empty() {
        return None;
    }
    Some(bundle_plan(
        phase.number,
        Bundle::Decisions,
        format!(
            "Resolve the decision checkpoints of phase {} before implementation starts. \
             Record each decision and its rationale in the summary.",
            phase.number
        ),
        tasks,
        Vec::new(),
        now,
    ))
}

/// Manual and verification plans, once the phase's ordinary work is complete.
///
/// Each bundle is created at most once: an existing plan with the reserved
/// number suppresses it.
pub fn late_bundles(
    phase: &PhasePlans,
    open_blockers: &[ObservationBody],
    now: DateTime<Utc>,
) -> Vec<Plan> {
    if !phase.ordinary_complete() {
        return Vec::new();
    }
    let mut bundles = Vec::new();

    if !phase.has_plan(Bundle::Manual.plan_number()) {
        let tasks = collect_tasks(phase, |plan, task| {
            !plan.is_manual_only()
                && task.kind == TaskType::Manual
                && task.checkpoint.is_none()
                && task.status != TaskStatus::Complete
        });
        if !tasks.is_empty() {
            bundles.push(bundle_plan(
                phase.number,
                Bundle::Manual,
                format!(
                    "Hand off the human-action tasks of phase {}: automate what can be \
                     prepared and document the remaining manual steps in the summary.",
                    phase.number
                ),
                tasks,
                Vec::new(),
                now,
            ));
        }
    }

    if !phase.has_plan(Bundle::Verification.plan_number()) {
        let mut tasks = collect_tasks(phase, |_, task| {
            task.checkpoint == Some(Checkpoint::Review) && task.status != TaskStatus::Complete
        });
        for (index, blocker) in open_blockers.iter().enumerate() {
            tasks.push(blocker_task(index + 1, blocker));
        }
        if !tasks.is_empty() {
            let verification = phase
                .ordinary()
                .flat_map(|plan| plan.verification.iter().cloned())
                .fold(Vec::new(), |mut acc: Vec<String>, cmd| {
                    if !acc.contains(&cmd) {
                        acc.push(cmd);
                    }
                    acc
                });
            bundles.push(bundle_plan(
                phase.number,
                Bundle::Verification,
                format!(
                    "Verify phase {}: review the checkpoint items and confirm every open \
                     blocker is resolved or documented.",
                    phase.number
                ),
                tasks,
                verification,
                now,
            ));
        }
    }

    bundles
}

fn collect_tasks(phase: &PhasePlans, keep: impl Fn(&Plan, &Task) -> bool) -> Vec<Task> {
    let mut tasks = Vec::new();
    for plan in phase.ordinary() {
        let Some(id) = plan.id() else {
            continue;
        };
        for task in plan.tasks.iter().filter(|task| keep(plan, task)) {
            tasks.push(Task {
                id: format!("{}.{}", id.stem(), task.id),
                status: TaskStatus::Pending,
                ..task.clone()
            });
        }
    }
    tasks
}

fn blocker_task(index: usize, blocker: &ObservationBody) -> Task {
    Task {
        id: format!("blocker-{index}"),
        name: format!("Resolve blocker: {}", blocker.title),
        kind: TaskType::Auto,
        checkpoint: Some(Checkpoint::Review),
        files: blocker.file.iter().cloned().collect(),
        action: blocker.description.clone(),
        verify: Some(format!("Confirm the blocker '{}' no longer applies", blocker.title)),
        done: "Blocker resolved or documented with a workaround".to_string(),
        status: TaskStatus::Pending,
    }
}

fn bundle_plan(
    phase: u32,
    bundle: Bundle,
    objective: String,
    tasks: Vec<Task>,
    verification: Vec<String>,
    now: DateTime<Utc>,
) -> Plan {
    Plan {
        phase,
        plan: bundle.plan_number().to_string(),
        status: Status::Pending,
        objective,
        bundle: Some(bundle),
        tasks,
        verification,
        validation: None,
        created_at: now,
        completed_at: None,
    }
}

/// Phase status derived from its plans.
pub fn derive_phase_status(plans: &[Plan]) -> Status {
    if plans.is_empty() || plans.iter().all(|plan| plan.status == Status::Pending) {
        return Status::Pending;
    }
    if plans.iter().any(|plan| plan.status == Status::Failed) {
        return Status::Failed;
    }
    if plans.iter().all(|plan| plan.status == Status::Complete) {
        return Status::Complete;
    }
    Status::InProgress
}

/// Mark a plan complete, syncing task statuses from the agent's progress record.
///
/// Only `complete` and `deferred` are taken from progress. Autonomous tasks complete
/// with the plan; manual and checkpoint tasks keep their status unless reported done,
/// so they still reach the late bundles.
pub fn mark_complete(plan: &mut Plan, progress: Option<&ProgressRecord>, now: DateTime<Utc>) {
    plan.status = Status::Complete;
    plan.completed_at = Some(now);
    for task in &mut plan.tasks {
        let reported = progress.and_then(|progress| {
            progress
                .tasks
                .iter()
                .find(|entry| entry.id == task.id)
                .map(|entry| entry.status)
        });
        task.status = match reported {
            Some(status @ (TaskStatus::Complete | TaskStatus::Deferred)) => status,
            _ if task.is_autonomous() => TaskStatus::Complete,
            _ => task.status,
        };
    }
}

pub fn mark_failed(plan: &mut Plan, now: DateTime<Utc>) {
    plan.status = Status::Failed;
    plan.completed_at = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{auto_task, fixed_time, manual_task, plan};

    fn phase(number: u32, plans: Vec<Plan>) -> PhasePlans {
        PhasePlans::new(number, plans)
    }

    fn complete(mut plan: Plan) -> Plan {
        mark_complete(&mut plan, None, fixed_time());
        plan
    }

    #[test]
    fn next_plan_walks_phase_then_number() {
        let phases = vec![
            phase(2, vec![plan(2, "01", vec![auto_task("1")])]),
            phase(
                1,
                vec![
                    plan(1, "10", vec![auto_task("1")]),
                    complete(plan(1, "02", vec![auto_task("1")])),
                    plan(1, "5.1", vec![auto_task("1")]),
                ],
            ),
        ];
        assert_eq!(
            next_plan(&phases),
            NextPlan::Run(PlanId::parse("01-5.1").expect("id"))
        );
    }

    #[test]
    fn failed_plan_blocks_selection() {
        let mut failed = plan(1, "01", vec![auto_task("1")]);
        mark_failed(&mut failed, fixed_time());
        let phases = vec![phase(1, vec![failed, plan(1, "02", vec![auto_task("1")])])];
        assert_eq!(
            next_plan(&phases),
            NextPlan::Failed(PlanId::parse("01-01").expect("id"))
        );
    }

    #[test]
    fn decisions_bundle_collects_decision_checkpoints_once() {
        let mut decision = auto_task("2");
        decision.checkpoint = Some(Checkpoint::Decision);
        let mut phase_plans = phase(3, vec![plan(3, "01", vec![auto_task("1"), decision])]);

        let bundle = decisions_bundle(&phase_plans, fixed_time()).expect("bundle");
        assert_eq!(bundle.plan, "00");
        assert_eq!(bundle.bundle, Some(Bundle::Decisions));
        assert_eq!(bundle.tasks.len(), 1);
        assert_eq!(bundle.tasks[0].id, "03-01.2");

        phase_plans = PhasePlans::new(3, [phase_plans.plans, vec![bundle]].concat());
        assert!(decisions_bundle(&phase_plans, fixed_time()).is_none());
        assert_eq!(
            next_plan(std::slice::from_ref(&phase_plans)),
            NextPlan::Run(PlanId::parse("03-00").expect("id"))
        );
    }

    #[test]
    fn late_bundles_wait_for_ordinary_plans() {
        let mut review = auto_task("3");
        review.checkpoint = Some(Checkpoint::Review);
        let source = plan(1, "01", vec![auto_task("1"), manual_task("2"), review]);

        let open = phase(1, vec![source.clone()]);
        assert!(late_bundles(&open, &[], fixed_time()).is_empty());

        let done = phase(1, vec![complete(source)]);
        let blocker = ObservationBody {
            title: "Flaky CI".to_string(),
            description: "intermittent".to_string(),
            file: None,
        };
        let bundles = late_bundles(&done, std::slice::from_ref(&blocker), fixed_time());
        let numbers: Vec<&str> = bundles.iter().map(|plan| plan.plan.as_str()).collect();
        assert_eq!(numbers, vec!["99", "100"]);
        assert!(bundles[0].is_manual_only());
        assert_eq!(bundles[1].tasks.len(), 2);
        assert!(bundles[1].tasks[1].name.contains("Flaky CI"));
    }

    /// Verifies progress entries other than complete or deferred never finish a manual task.
    #[test]
    fn reported_pending_manual_task_still_reaches_manual_bundle() {
        let mut source = plan(1, "01", vec![auto_task("1"), manual_task("2")]);
        let progress = ProgressRecord {
            plan: "01-01".to_string(),
            tasks: vec![
                crate::core::records::ProgressTask {
                    id: "1".to_string(),
                    status: TaskStatus::InProgress,
                },
                crate::core::records::ProgressTask {
                    id: "2".to_string(),
                    status: TaskStatus::Pending,
                },
            ],
            notes: String::new(),
        };
        mark_complete(&mut source, Some(&progress), fixed_time());
        assert_eq!(source.tasks[0].status, TaskStatus::Complete);
        assert_eq!(source.tasks[1].status, TaskStatus::Pending);

        let bundles = late_bundles(&phase(1, vec![source]), &[], fixed_time());
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].tasks[0].id, "01-01.2");
    }

    #[test]
    fn late_bundles_are_idempotent() {
        let source = complete(plan(1, "01", vec![auto_task("1"), manual_task("2")]));
        let first = late_bundles(&phase(1, vec![source.clone()]), &[], fixed_time());
        assert_eq!(first.len(), 1);
        let with_bundle = phase(1, [vec![source], first].concat());
        assert!(late_bundles(&with_bundle, &[], fixed_time()).is_empty());
    }

    #[test]
    fn active_phase_skips_finished_phases() {
        let phases = vec![
            phase(1, vec![complete(plan(1, "01", vec![auto_task("1")]))]),
            phase(2, vec![plan(2, "01", vec![auto_task("1")])]),
        ];
        let active = active_phase(&phases, |_| Vec::new()).expect("active");
        assert_eq!(active.number, 2);
    }

    #[test]
    fn phase_status_is_derived() {
        let pending = plan(1, "01", vec![auto_task("1")]);
        let done = complete(plan(1, "02", vec![auto_task("1")]));
        assert_eq!(derive_phase_status(std::slice::from_ref(&pending)), Status::Pending);
        assert_eq!(
            derive_phase_status(&[pending.clone(), done.clone()]),
            Status::InProgress
        );
        assert_eq!(derive_phase_status(std::slice::from_ref(&done)), Status::Complete);
    }
}
