//! Semantic invariants not expressible via JSON Schema.
//!
//! Each check returns [`FieldError`]s in the same shape as schema violations so
//! the self-heal path treats both uniformly.

use std::collections::HashSet;

use crate::core::plan_number::PlanNumber;
use crate::core::records::{Plan, Roadmap, Status, TaskType};
use crate::core::validation::FieldError;

/// Check plan invariants:
/// - at least one task
/// - auto tasks carry a non-empty `verify` command
/// - task ids are unique
/// - `completed_at` is present exactly when the status is terminal
/// - the plan number is well formed
pub fn plan_invariants(plan: &Plan) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if PlanNumber::parse(&plan.plan).is_none() {
        errors.push(FieldError::new(
            ".plan",
            "a plan number such as 01 or 5.1",
            format!("{:?}", plan.plan),
            "use dot-separated digits",
        ));
    }

    if plan.tasks.is_empty() {
        errors.push(FieldError::new(
            ".tasks",
            "at least 1 task",
            "[]",
            "add the plan's tasks",
        ));
    }

    let mut seen = HashSet::new();
    for (index, task) in plan.tasks.iter().enumerate() {
        if !seen.insert(task.id.as_str()) {
            errors.push(FieldError::new(
                format!(".tasks[{index}].id"),
                "a task id unique within the plan",
                format!("{:?}", task.id),
                "renumber the duplicate task",
            ));
        }
        let missing_verify = task
            .verify
            .as_deref()
            .is_none_or(|verify| verify.trim().is_empty());
        if task.kind == TaskType::Auto && missing_verify {
            errors.push(FieldError::new(
                format!(".tasks[{index}].verify"),
                "verify command is required for auto tasks",
                match &task.verify {
                    Some(verify) => format!("{verify:?}"),
                    None => "missing".to_string(),
                },
                "add a shell command that proves the task is done",
            ));
        }
    }

    match (plan.status.is_terminal(), plan.completed_at.is_some()) {
        (true, false) => errors.push(FieldError::new(
            ".completed_at",
            format!("a timestamp when status is {}", plan.status.as_str()),
            "missing",
            "set completed_at to the completion time",
        )),
        (false, true) => errors.push(FieldError::new(
            ".completed_at",
            format!("no timestamp while status is {}", plan.status.as_str()),
            "present",
            "remove completed_at or finish the plan",
        )),
        _ => {}
    }

    errors
}

/// Check roadmap invariants: at least one phase, phase numbers positive and unique.
pub fn roadmap_invariants(roadmap: &Roadmap) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if roadmap.phases.is_empty() {
        errors.push(FieldError::new(
            ".phases",
            "at least 1 phase",
            "[]",
            "add the project's phases",
        ));
    }
    let mut seen = HashSet::new();
    for (index, phase) in roadmap.phases.iter().enumerate() {
        if phase.number == 0 {
            errors.push(FieldError::new(
                format!(".phases[{index}].number"),
                "a positive phase number",
                "0",
                "number phases from 1",
            ));
        }
        if !seen.insert(phase.number) {
            errors.push(FieldError::new(
                format!(".phases[{index}].number"),
                "a phase number unique within the roadmap",
                phase.number.to_string(),
                "renumber the duplicate phase",
            ));
        }
    }
    errors
}

/// Reject a save that would move a plan's status backwards.
pub fn status_transition(previous: Status, next: Status) -> Option<FieldError> {
    if previous.can_advance_to(next) {
        return None;
    }
    Some(FieldError::new(
        ".status",
        format!("{} or a later status", previous.as_str()),
        next.as_str(),
        format!("keep status at {} or advance it", previous.as_str()),
    ))
}
