//! CLI tests for `conductor next` and `conductor validate`.
//!
//! Spawns the binary and verifies exit codes and output for open, complete
//! and failed roadmaps.

use std::fs;
use std::process::Command;

use conductor::core::records::Status;
use conductor::exit_codes;
use conductor::io::ledger::Ledger;
use conductor::io::paths::LedgerPaths;
use conductor::test_support::{auto_task, fixed_time, plan, roadmap};

fn seed(root: &std::path::Path, status: Status) {
    let ledger = Ledger::new(LedgerPaths::new(root));
    ledger
        .save_roadmap(&roadmap(vec![(1, vec!["01-01"])]))
        .expect("roadmap");
    let mut record = plan(1, "01", vec![auto_task("1")]);
    record.status = status;
    if status.is_terminal() {
        record.completed_at = Some(fixed_time());
    }
    ledger.save_plan(&record).expect("plan");
}

fn conductor(root: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_conductor"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("spawn conductor")
}

#[test]
fn next_prints_the_open_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed(temp.path(), Status::Pending);

    let output = conductor(temp.path(), &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "01-01");
}

#[test]
fn next_on_finished_roadmap_exits_with_complete_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed(temp.path(), Status::Complete);

    let output = conductor(temp.path(), &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::COMPLETE));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "complete");
}

#[test]
fn next_on_failed_plan_exits_with_hard_failure_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed(temp.path(), Status::Failed);

    let output = conductor(temp.path(), &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::HARD_FAILURE));
    assert!(String::from_utf8_lossy(&output.stderr).contains("01-01"));
}

/// Verifies `validate` names the broken file and field without touching it.
#[test]
fn validate_reports_invalid_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed(temp.path(), Status::Pending);
    let plan_path = temp.path().join(".planning/phases/01/01-01-plan.json");
    let broken = fs::read_to_string(&plan_path)
        .expect("read")
        .replace("\"verify\": \"cargo test\",", "");
    fs::write(&plan_path, &broken).expect("write");

    let output = conductor(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("01-01-plan.json"));
    assert!(stderr.contains(".tasks[0].verify"));
    assert_eq!(fs::read_to_string(&plan_path).expect("read"), broken);
}

#[test]
fn validate_accepts_clean_ledger() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed(temp.path(), Status::Pending);

    let output = conductor(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
}
