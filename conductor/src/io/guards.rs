//! Validation gate: a plan's `validation` commands, run after a success verdict.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::stream::push_tail;
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct GateRequest {
    pub workdir: PathBuf,
    pub commands: Vec<String>,
    /// Combined output of every command is appended here.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Size of the output tail carried into retry guidance.
    pub tail_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    /// First failing command and the tail of its output.
    Fail { command: String, output_tail: String },
    Skipped,
}

pub trait GateRunner {
    fn run(&self, request: &GateRequest) -> Result<GateOutcome>;
}

/// Runs each command through `sh -c`, stopping at the first failure.
pub struct ShellGateRunner;

impl GateRunner for ShellGateRunner {
    #[instrument(skip_all, fields(commands = request.commands.len()))]
    fn run(&self, request: &GateRequest) -> Result<GateOutcome> {
        let mut log = String::new();
        for command in &request.commands {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command).current_dir(&request.workdir);
            let output = run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)
                .with_context(|| format!("run validation command {command}"))?;
            let text = output.combined();
            log.push_str(&format!("=== {command} ===\n{text}\n"));

            let failed = output.timed_out || !output.status.success();
            if failed {
                let mut output_tail = String::new();
                push_tail(&mut output_tail, text.trim_end(), request.tail_bytes);
                if output.timed_out {
                    output_tail.push_str("\n[command timed out]");
                }
                warn!(command = %command, exit_code = ?output.status.code(), timed_out = output.timed_out, "validation command failed");
                write_gate_log(&request.log_path, &log, request.output_limit_bytes)?;
                return Ok(GateOutcome::Fail {
                    command: command.clone(),
                    output_tail,
                });
            }
            info!(command = %command, "validation command passed");
        }
        write_gate_log(&request.log_path, &log, request.output_limit_bytes)?;
        Ok(GateOutcome::Pass)
    }
}

pub fn run_gate_if_needed<R: GateRunner + ?Sized>(
    enabled: bool,
    runner: &R,
    request: &GateRequest,
) -> Result<GateOutcome> {
    if !enabled || request.commands.is_empty() {
        return Ok(GateOutcome::Skipped);
    }
    runner.run(request)
}

fn write_gate_log(path: &Path, contents: &str, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create validation log dir {}", parent.display()))?;
    }
    if contents.len() > output_limit {
        let mut cut = output_limit;
        while !contents.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!(
            "{}\n[truncated {} bytes]\n",
            &contents[..cut],
            contents.len() - cut
        );
        fs::write(path, truncated)
            .with_context(|| format!("write validation log {}", path.display()))?;
        return Ok(());
    }
    fs::write(path, contents).with_context(|| format!("write validation log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeGateRunner {
        outcome: GateOutcome,
    }

    impl GateRunner for FakeGateRunner {
        fn run(&self, _request: &GateRequest) -> Result<GateOutcome> {
            Ok(self.outcome.clone())
        }
    }

    fn request(root: &Path, commands: &[&str]) -> GateRequest {
        GateRequest {
            workdir: root.to_path_buf(),
            commands: commands.iter().map(|c| (*c).to_string()).collect(),
            log_path: root.join("validation.log"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1000,
            tail_bytes: 200,
        }
    }

    #[test]
    fn gate_skips_when_disabled_or_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = FakeGateRunner {
            outcome: GateOutcome::Pass,
        };
        let outcome =
            run_gate_if_needed(false, &runner, &request(temp.path(), &["true"])).expect("gate");
        assert_eq!(outcome, GateOutcome::Skipped);
        let outcome = run_gate_if_needed(true, &runner, &request(temp.path(), &[])).expect("gate");
        assert_eq!(outcome, GateOutcome::Skipped);
    }

    #[cfg(unix)]
    #[test]
    fn shell_gate_stops_at_first_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), &["echo ok", "echo broken >&2; exit 1", "echo never"]);
        let outcome = ShellGateRunner.run(&req).expect("gate");
        let GateOutcome::Fail {
            command,
            output_tail,
        } = outcome
        else {
            panic!("expected failure");
        };
        assert_eq!(command, "echo broken >&2; exit 1");
        assert!(output_tail.contains("broken"));
        let log = fs::read_to_string(&req.log_path).expect("log");
        assert!(log.contains("=== echo ok ==="));
        assert!(!log.contains("never"));
    }

    #[cfg(unix)]
    #[test]
    fn shell_gate_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = ShellGateRunner
            .run(&request(temp.path(), &["true", "echo fine"]))
            .expect("gate");
        assert_eq!(outcome, GateOutcome::Pass);
    }
}
