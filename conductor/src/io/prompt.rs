//! Prompt rendering for every agent call.
//!
//! Prompt bodies are opaque payloads kept in `prompts/*.md` and rendered with
//! minijinja; this module only assembles the context each one needs.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::records::{Plan, Task};
use crate::core::repair::{render_error_block, render_error_list};
use crate::core::types::ExecutionContext;
use crate::core::validation::ValidationReport;

const EXECUTE_TEMPLATE: &str = include_str!("prompts/execute.md");
const BLOCKER_TEMPLATE: &str = include_str!("prompts/blocker.md");
const RECOVERY_TEMPLATE: &str = include_str!("prompts/recovery.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const ANALYSIS_TEMPLATE: &str = include_str!("prompts/analysis.md");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    for (name, source) in [
        ("execute", EXECUTE_TEMPLATE),
        ("blocker", BLOCKER_TEMPLATE),
        ("recovery", RECOVERY_TEMPLATE),
        ("repair", REPAIR_TEMPLATE),
        ("analysis", ANALYSIS_TEMPLATE),
    ] {
        env.add_template(name, source)
            .expect("embedded prompt template should be valid");
    }
    env
});

#[derive(Debug, Clone, Serialize)]
struct PlanContext<'a> {
    id: String,
    objective: &'a str,
    tasks: &'a [Task],
    verification: &'a [String],
}

/// Ledger paths the executing agent reads and writes, relative to the workspace.
#[derive(Debug, Clone, Serialize)]
pub struct PlanPaths {
    pub plan: String,
    pub progress: String,
    pub summary: String,
}

/// Inputs for the plan execution prompt.
#[derive(Debug, Clone)]
pub struct ExecutePrompt<'a> {
    pub plan: &'a Plan,
    pub paths: PlanPaths,
    /// Retry guidance carried over from earlier attempts.
    pub guidance: Option<&'a str>,
}

pub fn render_execute(input: &ExecutePrompt<'_>) -> Result<String> {
    let plan = input.plan;
    let rendered = ENGINE.get_template("execute")?.render(context! {
        plan => PlanContext {
            id: plan.id().map_or_else(|| format!("{}-{}", plan.phase, plan.plan), |id| id.to_string()),
            objective: plan.objective.trim(),
            tasks: &plan.tasks,
            verification: &plan.verification,
        },
        bundle => plan.bundle.map(|bundle| bundle.label()),
        manual_mode => plan.is_manual_only(),
        paths => &input.paths,
        guidance => input.guidance.map(str::trim).filter(|g| !g.is_empty()),
    })?;
    Ok(rendered)
}

pub fn render_blocker(plan_id: &str, detail: &str, last_output: &str, planning_dir: &str) -> Result<String> {
    let rendered = ENGINE.get_template("blocker")?.render(context! {
        plan_id => plan_id,
        detail => detail,
        last_output => last_output.trim(),
        planning_dir => planning_dir,
    })?;
    Ok(rendered)
}

#[derive(Debug, Clone, Serialize)]
struct ExecutionContextView<'a> {
    last_error: &'a str,
    log_lines: &'a [String],
    last_tool: Option<&'a str>,
    fallback_log: Option<&'a str>,
}

pub fn render_recovery(plan_id: &str, context: &ExecutionContext) -> Result<String> {
    let view = ExecutionContextView {
        last_error: &context.last_error,
        log_lines: &context.log_lines,
        last_tool: context.last_tool.as_deref(),
        fallback_log: context.fallback_log.as_deref().map(str::trim).filter(|log| !log.is_empty()),
    };
    let signal = context.failure_signal.as_ref().map(|signal| {
        if signal.detail.is_empty() {
            signal.kind.token().to_string()
        } else {
            format!("{}: {}", signal.kind.token(), signal.detail)
        }
    });
    let rendered = ENGINE.get_template("recovery")?.render(context! {
        plan_id => plan_id,
        context => view,
        signal => signal,
    })?;
    Ok(rendered)
}

pub fn render_repair(path: &str, report: &ValidationReport) -> Result<String> {
    let rendered = ENGINE.get_template("repair")?.render(context! {
        kind => report.kind.label(),
        path => path,
        error_list => render_error_list(report),
        error_block => render_error_block(report),
        schema => report.kind.schema_source().trim(),
    })?;
    Ok(rendered)
}

pub fn render_analysis(plan_id: &str, objective: &str, outcome: &str, last_output: &str) -> Result<String> {
    let rendered = ENGINE.get_template("analysis")?.render(context! {
        plan_id => plan_id,
        objective => objective.trim(),
        outcome => outcome,
        last_output => last_output.trim(),
    })?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::repair::parse_error_block;
    use crate::core::sentinel::{Signal, SignalKind};
    use crate::core::validation::{FieldError, RecordKind};
    use crate::test_support::{auto_task, manual_task, plan};

    fn paths() -> PlanPaths {
        PlanPaths {
            plan: ".planning/phases/01/01-01-plan.json".to_string(),
            progress: ".planning/phases/01/01-01-progress.json".to_string(),
            summary: ".planning/phases/01/01-01-summary.json".to_string(),
        }
    }

    #[test]
    fn execute_prompt_lists_tasks_and_guidance() {
        let record = plan(1, "01", vec![auto_task("1"), manual_task("2")]);
        let prompt = render_execute(&ExecutePrompt {
            plan: &record,
            paths: paths(),
            guidance: Some("Previous attempt 1 of 3 ended with: token limit bailout."),
        })
        .expect("render");
        assert!(prompt.contains("# Plan 01-01"));
        assert!(prompt.contains("### Task 1:"));
        assert!(prompt.contains("### Task 2:"));
        assert!(prompt.contains("01-01-summary.json"));
        assert!(prompt.contains("## Guidance from the previous attempt"));
        assert!(prompt.contains("## Manual tasks"));
    }

    #[test]
    fn manual_only_plan_renders_hand_off_mode() {
        let record = plan(1, "99", vec![manual_task("1")]);
        let prompt = render_execute(&ExecutePrompt {
            plan: &record,
            paths: paths(),
            guidance: None,
        })
        .expect("render");
        assert!(prompt.contains("## Hand-off mode"));
        assert!(!prompt.contains("Guidance from the previous attempt"));
    }

    /// Verifies the repair prompt keeps the machine-readable error block intact.
    #[test]
    fn repair_prompt_embeds_errors_and_schema() {
        let report = ValidationReport::new(
            RecordKind::Plan,
            vec![FieldError::new(".tasks", "array of tasks", "missing", "add a tasks array")],
        );
        let prompt = render_repair(".planning/phases/01/01-01-plan.json", &report).expect("render");
        assert!(prompt.contains("\"additionalProperties\""));
        assert_eq!(parse_error_block(&prompt).expect("block"), report.errors);
    }

    #[test]
    fn recovery_prompt_includes_signal_and_log() {
        let mut context = ExecutionContext::new("failed to start claude");
        context.log_lines = vec!["line one".to_string()];
        context.failure_signal = Some(Signal {
            kind: SignalKind::BuildFailed,
            detail: "linker".to_string(),
        });
        let prompt = render_recovery("01-02", &context).expect("render");
        assert!(prompt.contains("failed to start claude"));
        assert!(prompt.contains("BUILD_FAILED: linker"));
        assert!(prompt.contains("line one"));
    }
}
