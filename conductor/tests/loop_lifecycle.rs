//! Loop-level tests for full engine lifecycle scenarios.
//!
//! These drive `run_loop` against a temp workspace with a scripted agent to
//! verify plan ordering, bundle synthesis, retry and stuck detection, blocker
//! handling, self-heal and loop termination.

use std::fs;
use std::path::Path;

use conductor::core::plan_number::PlanId;
use conductor::core::records::{Checkpoint, Plan, Status};
use conductor::core::recovery::RetryBook;
use conductor::core::sentinel::SignalKind;
use conductor::error::EngineError;
use conductor::execute::Engine;
use conductor::io::config::EngineConfig;
use conductor::io::guards::{GateOutcome, GateRequest, GateRunner};
use conductor::io::ledger::Ledger;
use conductor::io::paths::LedgerPaths;
use conductor::looping::{LoopStop, run_loop};
use conductor::select::{SelectOutcome, select_from_root};
use conductor::test_support::{
    ScriptedAgent, ScriptedRun, auto_task, manual_task, plan, result_line, roadmap,
};

struct PassGate;

impl GateRunner for PassGate {
    fn run(&self, _request: &GateRequest) -> anyhow::Result<GateOutcome> {
        Ok(GateOutcome::Pass)
    }
}

fn config(max_retries: u32) -> EngineConfig {
    EngineConfig {
        analysis: false,
        max_retries_per_plan: Some(max_retries),
        ..EngineConfig::default()
    }
}

fn seed(root: &Path, phases: Vec<(u32, Vec<Plan>)>) -> Ledger {
    let ledger = Ledger::new(LedgerPaths::new(root));
    let ids: Vec<(u32, Vec<String>)> = phases
        .iter()
        .map(|(number, plans)| {
            (
                *number,
                plans
                    .iter()
                    .map(|plan| plan.id().expect("id").to_string())
                    .collect(),
            )
        })
        .collect();
    let listing = ids
        .iter()
        .map(|(number, plans)| (*number, plans.iter().map(String::as_str).collect()))
        .collect();
    ledger.save_roadmap(&roadmap(listing)).expect("roadmap");
    for (_, plans) in &phases {
        for plan in plans {
            ledger.save_plan(plan).expect("plan");
        }
    }
    ledger
}

fn file_stem(id: &str) -> String {
    let id = PlanId::parse(id).expect("id");
    format!(".planning/phases/{:02}/{}", id.phase, id.stem())
}

fn summary_file(id: &str) -> (String, String) {
    let body = serde_json::json!({
        "plan": id,
        "one_liner": format!("{id} done"),
        "accomplishments": ["did the work"],
        "files_modified": [],
        "completed_at": "2026-01-01T00:00:00Z"
    });
    (format!("{}-summary.json", file_stem(id)), body.to_string())
}

fn progress_file(id: &str, tasks: &[(&str, &str)], notes: &str) -> (String, String) {
    let tasks: Vec<serde_json::Value> = tasks
        .iter()
        .map(|(task, status)| serde_json::json!({"id": task, "status": status}))
        .collect();
    let body = serde_json::json!({"plan": id, "tasks": tasks, "notes": notes});
    (format!("{}-progress.json", file_stem(id)), body.to_string())
}

fn complete_run(id: &str) -> ScriptedRun {
    let (path, body) = summary_file(id);
    ScriptedRun::lines(vec![result_line("all done ###PLAN_COMPLETE###")]).writes(path, body)
}

fn silent_run(progress: (String, String)) -> ScriptedRun {
    ScriptedRun::lines(vec![result_line("stopped for now")]).writes(progress.0, progress.1)
}

/// Full lifecycle: retry, completion, manual and verification bundles in band
/// order, then the next phase.
///
/// Execution sequence:
/// 1. 01-01 ends without a signal (soft, retried with guidance)
/// 2. 01-01 completes; task 3 deferred, review task 2 left for verification
/// 3. 01-99 (synthesized manual bundle) runs in hand-off mode
/// 4. 01-100 (synthesized verification bundle)
/// 5. 02-01
/// 6. nothing left: loop reports complete
#[test]
fn full_lifecycle_runs_bundles_in_band_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut review = auto_task("2");
    review.checkpoint = Some(Checkpoint::Review);
    let ledger = seed(
        temp.path(),
        vec![
            (1, vec![plan(1, "01", vec![auto_task("1"), review, manual_task("3")])]),
            (2, vec![plan(2, "01", vec![auto_task("1")])]),
        ],
    );

    let (progress_path, finished) =
        progress_file("01-01", &[("1", "complete"), ("3", "deferred")], "");
    let agent = ScriptedAgent::from_runs(vec![
        silent_run(progress_file("01-01", &[("1", "in_progress")], "halfway")),
        complete_run("01-01").writes(progress_path, finished),
        complete_run("01-99"),
        complete_run("01-100"),
        complete_run("02-01"),
    ]);
    let engine = Engine::new(temp.path(), config(3), &agent, &PassGate);

    let mut seen = Vec::new();
    let outcome = run_loop(&engine, RetryBook::default(), |report| {
        seen.push((report.plan.to_string(), report.outcome.label()));
    })
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.steps_executed, 5);
    assert!(outcome.retries.is_empty());
    let plans: Vec<&str> = seen.iter().map(|(plan, _)| plan.as_str()).collect();
    assert_eq!(plans, vec!["01-01", "01-01", "01-99", "01-100", "02-01"]);
    assert_eq!(seen[0].1, "soft:no_signal");
    assert_eq!(agent.remaining(), 0);

    let requests = agent.requests();
    assert!(requests[1].prompt.contains("exited without completion signal"));
    assert!(requests[2].prompt.contains("Hand-off mode"));

    let manual = ledger
        .load_plan(&PlanId::parse("01-99").expect("id"))
        .expect("manual bundle");
    assert_eq!(manual.tasks[0].id, "01-01.3");
    assert_eq!(manual.status, Status::Complete);
    let verification = ledger
        .load_plan(&PlanId::parse("01-100").expect("id"))
        .expect("verification bundle");
    assert_eq!(verification.tasks[0].id, "01-01.2");
    assert_eq!(verification.verification, vec!["cargo test".to_string()]);

    let roadmap = ledger.load_roadmap().expect("roadmap");
    assert!(roadmap.phases.iter().all(|phase| phase.status == Status::Complete));
    assert!(roadmap.phases[0].plans.contains(&"01-100".to_string()));
    let state = ledger.load_state().expect("state");
    assert_eq!(state.completed_plans, 4);
    assert_eq!(state.last_iteration, 5);
    for iter in 1..=5 {
        assert!(
            temp.path()
                .join(format!(".planning/iterations/{iter}/meta.json"))
                .is_file()
        );
    }
    assert_eq!(
        select_from_root(temp.path()).expect("select"),
        SelectOutcome::Complete
    );
}

/// Two attempts leave byte-identical progress once retries are exhausted.
#[test]
fn stuck_plan_stops_with_named_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed(temp.path(), vec![(1, vec![plan(1, "01", vec![auto_task("1")])])]);
    let progress = || progress_file("01-01", &[("1", "in_progress")], "same");
    let agent = ScriptedAgent::from_runs(vec![silent_run(progress()), silent_run(progress())]);
    let engine = Engine::new(temp.path(), config(2), &agent, &PassGate);

    let err = run_loop(&engine, RetryBook::default(), |_| {}).expect_err("stuck");
    match err {
        EngineError::RetriesExhausted {
            plan,
            attempts,
            max,
        } => {
            assert_eq!(plan.to_string(), "01-01");
            assert_eq!((attempts, max), (2, 2));
        }
        other => panic!("expected RetriesExhausted, got {other}"),
    }
    assert_eq!(agent.requests().len(), 2);
}

/// Progress that keeps moving resets the counter and the plan keeps running.
#[test]
fn moving_progress_keeps_the_plan_running() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed(temp.path(), vec![(1, vec![plan(1, "01", vec![auto_task("1")])])]);
    let agent = ScriptedAgent::from_runs(vec![
        silent_run(progress_file("01-01", &[("1", "in_progress")], "step one")),
        silent_run(progress_file("01-01", &[("1", "in_progress")], "step two")),
        complete_run("01-01"),
    ]);
    let engine = Engine::new(temp.path(), config(1), &agent, &PassGate);

    let outcome = run_loop(&engine, RetryBook::default(), |_| {}).expect("loop");
    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.steps_executed, 3);
}

#[test]
fn completion_without_summary_is_retried() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed(temp.path(), vec![(1, vec![plan(1, "01", vec![auto_task("1")])])]);
    let agent = ScriptedAgent::from_runs(vec![
        ScriptedRun::lines(vec![result_line("###PLAN_COMPLETE###")]),
        complete_run("01-01"),
    ]);
    let engine = Engine::new(temp.path(), config(3), &agent, &PassGate);

    let mut labels = Vec::new();
    let outcome = run_loop(&engine, RetryBook::default(), |report| {
        labels.push(report.outcome.label());
    })
    .expect("loop");
    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(labels, vec!["soft:summary_missing", "success"]);
    assert!(
        agent.requests()[1]
            .prompt
            .contains("signaled complete but summary missing")
    );
}

/// A BLOCKED claim the verifier cannot settle is a hard, loop-ending failure.
#[test]
fn blocker_without_decision_fails_the_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ledger = seed(temp.path(), vec![(1, vec![plan(1, "01", vec![auto_task("1")])])]);
    let agent = ScriptedAgent::new(vec![
        vec![result_line("###BLOCKED:API key missing###")],
        vec![result_line("searched everywhere, not sure")],
    ]);
    let engine = Engine::new(temp.path(), config(3), &agent, &PassGate);

    let err = run_loop(&engine, RetryBook::default(), |_| {}).expect_err("hard failure");
    assert!(matches!(
        err,
        EngineError::HardFailure {
            kind: SignalKind::Blocked,
            ref detail,
            ..
        } if detail == "API key missing"
    ));
    let id = PlanId::parse("01-01").expect("id");
    assert_eq!(ledger.load_plan(&id).expect("plan").status, Status::Failed);
    assert_eq!(
        select_from_root(temp.path()).expect("select"),
        SelectOutcome::Failed(id)
    );
}

/// A blocker reported by analysis becomes a task of the phase's verification plan.
#[test]
fn analysis_blocker_becomes_verification_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ledger = seed(temp.path(), vec![(1, vec![plan(1, "01", vec![auto_task("1")])])]);
    let blocker = "```observation\n{\"type\":\"blocker\",\"title\":\"Flaky CI\",\"description\":\"integration job times out\"}\n```";
    let resolved = "```observation\n{\"type\":\"completion\",\"title\":\"Flaky CI\",\"description\":\"timeout raised\"}\n```";
    let agent = ScriptedAgent::from_runs(vec![
        complete_run("01-01"),
        ScriptedRun::lines(vec![result_line(blocker)]),
        complete_run("01-100"),
        ScriptedRun::lines(vec![result_line(resolved)]),
    ]);
    let engine = Engine::new(
        temp.path(),
        EngineConfig {
            analysis: true,
            ..config(3)
        },
        &agent,
        &PassGate,
    );

    let outcome = run_loop(&engine, RetryBook::default(), |_| {}).expect("loop");
    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.steps_executed, 2);

    let verification = ledger
        .load_plan(&PlanId::parse("01-100").expect("id"))
        .expect("verification bundle");
    assert_eq!(verification.tasks.len(), 1);
    assert_eq!(verification.tasks[0].id, "blocker-1");
    assert!(verification.tasks[0].name.contains("Flaky CI"));
    assert!(ledger.open_blockers(1).expect("blockers").is_empty());
}

/// An invalid plan on disk is repaired before the scheduler reads it.
#[test]
fn invalid_plan_is_healed_before_scheduling() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed(temp.path(), vec![(1, vec![plan(1, "01", vec![auto_task("1")])])]);
    let plan_path = temp.path().join(".planning/phases/01/01-01-plan.json");
    let good = fs::read_to_string(&plan_path).expect("read");
    fs::write(&plan_path, good.replace("\"verify\": \"cargo test\",", "")).expect("write");

    let agent = ScriptedAgent::from_runs(vec![
        ScriptedRun::lines(vec![result_line("restored the verify command")])
            .writes(".planning/phases/01/01-01-plan.json", good),
        complete_run("01-01"),
    ]);
    let engine = Engine::new(temp.path(), config(3), &agent, &PassGate);

    let outcome = run_loop(&engine, RetryBook::default(), |_| {}).expect("loop");
    assert_eq!(outcome.stop, LoopStop::Complete);
    let requests = agent.requests();
    assert_eq!(
        requests[0].allowed_tools,
        vec!["Read".to_string(), "Edit".to_string()]
    );
    assert!(requests[0].prompt.contains(".tasks[0].verify"));
}
