//! Persisted ledger records: roadmap, project state, plans, tasks, summaries,
//! progress and observations.
//!
//! Every struct mirrors a schema under `schemas/` and denies unknown fields, so a
//! record that deserializes has already passed the strict shape check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::observation::Observation;
use crate::core::plan_number::{PlanId, PlanNumber};

/// Lifecycle status shared by phases and plans.
///
/// Plans advance `pending → in_progress → {complete | failed}` and never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Complete => "complete",
            Status::Failed => "failed",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Status::Pending => 0,
            Status::InProgress => 1,
            Status::Complete | Status::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Complete | Status::Failed)
    }

    /// True if moving from `self` to `next` keeps the lifecycle monotonic.
    pub fn can_advance_to(self, next: Status) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Roadmap {
    pub project: String,
    pub phases: Vec<Phase>,
}

impl Roadmap {
    pub fn phase(&self, number: u32) -> Option<&Phase> {
        self.phases.iter().find(|phase| phase.number == number)
    }

    pub fn phase_mut(&mut self, number: u32) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|phase| phase.number == number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Phase {
    pub number: u32,
    pub name: String,
    pub goal: String,
    pub status: Status,
    /// Plan ids in `NN-PP` form.
    pub plans: Vec<String>,
}

/// Kind of work a task describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Auto,
    Manual,
}

/// Checkpoint marker used to bundle tasks into synthesized plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// A decision to make before the phase's ordinary plans run.
    Decision,
    /// A review to perform once the phase's ordinary plans are complete.
    Review,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    /// Handed to a bundled plan (manual or checkpoint work).
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    pub files: Vec<String>,
    pub action: String,
    /// Verification command; required for auto tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    pub done: String,
    pub status: TaskStatus,
}

impl Task {
    /// Work the executor agent may perform on its own.
    pub fn is_autonomous(&self) -> bool {
        self.kind == TaskType::Auto && self.checkpoint.is_none()
    }
}

/// Marker for plans the scheduler synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bundle {
    Decisions,
    Manual,
    Verification,
}

impl Bundle {
    pub fn plan_number(self) -> &'static str {
        use crate::core::plan_number::{DECISIONS_PLAN, MANUAL_PLAN, VERIFICATION_PLAN};
        match self {
            Bundle::Decisions => DECISIONS_PLAN,
            Bundle::Manual => MANUAL_PLAN,
            Bundle::Verification => VERIFICATION_PLAN,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Bundle::Decisions => "decisions",
            Bundle::Manual => "manual",
            Bundle::Verification => "verification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub phase: u32,
    pub plan: String,
    pub status: Status,
    pub objective: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<Bundle>,
    pub tasks: Vec<Task>,
    pub verification: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn id(&self) -> Option<PlanId> {
        PlanId::parse_parts(self.phase, &self.plan)
    }

    pub fn number(&self) -> Option<PlanNumber> {
        PlanNumber::parse(&self.plan)
    }

    /// True when every task needs a human.
    pub fn is_manual_only(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|task| task.kind == TaskType::Manual)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Summary {
    pub plan: String,
    pub one_liner: String,
    pub accomplishments: Vec<String>,
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub deviations: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_plan: Option<String>,
    pub completed_plans: u32,
    pub last_iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Agent-authored checklist kept next to a plan while it runs.
///
/// Read tolerantly: the agent writes it mid-flight, so unknown fields are allowed
/// and a parse failure only disables the heuristics that depend on it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub tasks: Vec<ProgressTask>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressTask {
    pub id: String,
    pub status: TaskStatus,
}

impl ProgressRecord {
    /// All listed tasks are complete (or deferred) and none are pending.
    pub fn all_tasks_complete(&self) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .iter()
                .all(|task| matches!(task.status, TaskStatus::Complete | TaskStatus::Deferred))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservationLog {
    pub phase: u32,
    pub entries: Vec<ObservationEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservationEntry {
    pub plan: String,
    pub recorded_at: DateTime<Utc>,
    pub observation: Observation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_never_regresses() {
        assert!(Status::Pending.can_advance_to(Status::InProgress));
        assert!(Status::Pending.can_advance_to(Status::Complete));
        assert!(Status::InProgress.can_advance_to(Status::Failed));
        assert!(Status::InProgress.can_advance_to(Status::InProgress));
        assert!(!Status::InProgress.can_advance_to(Status::Pending));
        assert!(!Status::Complete.can_advance_to(Status::InProgress));
        assert!(!Status::Failed.can_advance_to(Status::Complete));
    }

    #[test]
    fn task_serializes_type_field() {
        let task = Task {
            id: "1".to_string(),
            name: "Write parser".to_string(),
            kind: TaskType::Auto,
            checkpoint: None,
            files: vec!["src/parser.rs".to_string()],
            action: "implement".to_string(),
            verify: Some("cargo test parser".to_string()),
            done: "tests pass".to_string(),
            status: TaskStatus::Pending,
        };
        let value = serde_json::to_value(&task).expect("serialize");
        assert_eq!(value["type"], "auto");
        assert!(value.get("checkpoint").is_none());
    }

    #[test]
    fn progress_requires_every_task_done() {
        let mut progress = ProgressRecord {
            plan: "01-01".to_string(),
            tasks: vec![
                ProgressTask {
                    id: "1".to_string(),
                    status: TaskStatus::Complete,
                },
                ProgressTask {
                    id: "2".to_string(),
                    status: TaskStatus::Pending,
                },
            ],
            notes: String::new(),
        };
        assert!(!progress.all_tasks_complete());
        progress.tasks[1].status = TaskStatus::Deferred;
        assert!(progress.all_tasks_complete());
        assert!(!ProgressRecord::default().all_tasks_complete());
    }
}
