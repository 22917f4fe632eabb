//! Test-only helpers: record builders and a scripted agent.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};

use crate::core::records::{Phase, Plan, Roadmap, Status, Task, TaskStatus, TaskType};
use crate::core::stream::StreamError;
use crate::io::agent::{Agent, AgentExit, AgentRequest};
use crate::io::process::{CancelToken, ExitReason, InvokeError};

/// Deterministic timestamp for records built in tests.
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Auto task with a verify command.
pub fn auto_task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        name: format!("task {id}"),
        kind: TaskType::Auto,
        checkpoint: None,
        files: vec![format!("src/task_{id}.rs")],
        action: format!("implement task {id}"),
        verify: Some("cargo test".to_string()),
        done: format!("task {id} works"),
        status: TaskStatus::Pending,
    }
}

/// Manual task without a verify command.
pub fn manual_task(id: &str) -> Task {
    Task {
        kind: TaskType::Manual,
        verify: None,
        action: format!("a human performs step {id}"),
        ..auto_task(id)
    }
}

/// Pending plan with the given tasks.
pub fn plan(phase: u32, number: &str, tasks: Vec<Task>) -> Plan {
    Plan {
        phase,
        plan: number.to_string(),
        status: Status::Pending,
        objective: format!("objective of {phase:02}-{number}"),
        bundle: None,
        tasks,
        verification: vec!["cargo test".to_string()],
        validation: None,
        created_at: fixed_time(),
        completed_at: None,
    }
}

/// Roadmap from `(phase number, plan ids)` pairs.
pub fn roadmap(phases: Vec<(u32, Vec<&str>)>) -> Roadmap {
    Roadmap {
        project: "demo".to_string(),
        phases: phases
            .into_iter()
            .map(|(number, plans)| Phase {
                number,
                name: format!("phase {number}"),
                goal: format!("goal of phase {number}"),
                status: Status::Pending,
                plans: plans.into_iter().map(str::to_string).collect(),
            })
            .collect(),
    }
}

/// A `result` stream record carrying `text`.
pub fn result_line(text: &str) -> String {
    serde_json::json!({"type": "result", "result": text}).to_string()
}

/// An `assistant` stream record with one text block and usage counters.
pub fn assistant_line(text: &str, input_tokens: u64, output_tokens: u64) -> String {
    serde_json::json!({
        "type": "assistant",
        "message": {
            "content": [{"type": "text", "text": text}],
            "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens}
        }
    })
    .to_string()
}

/// One scripted invocation: files to write, then lines to emit.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub lines: Vec<String>,
    /// Paths relative to the request's workdir.
    pub files: Vec<(PathBuf, String)>,
    pub spawn_failure: bool,
}

impl ScriptedRun {
    pub fn lines(lines: Vec<String>) -> Self {
        Self {
            lines,
            ..Self::default()
        }
    }

    pub fn spawn_failure() -> Self {
        Self {
            spawn_failure: true,
            ..Self::default()
        }
    }

    pub fn writes(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.files.push((path.into(), contents.into()));
        self
    }
}

/// Agent that replays scripted runs in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    runs: RefCell<VecDeque<ScriptedRun>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(scripts: Vec<Vec<String>>) -> Self {
        Self::from_runs(scripts.into_iter().map(ScriptedRun::lines).collect())
    }

    pub fn from_runs(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.runs.borrow().len()
    }
}

impl Agent for ScriptedAgent {
    fn invoke(
        &self,
        request: &AgentRequest,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<AgentExit, InvokeError> {
        self.requests.borrow_mut().push(request.clone());
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no run left"))?;
        if run.spawn_failure {
            return Err(InvokeError::Spawn {
                program: "scripted".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }
        for (path, contents) in &run.files {
            let path = request.workdir.join(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| anyhow!(err))?;
            }
            fs::write(&path, contents).map_err(|err| anyhow!(err))?;
        }
        if let Some(log) = &request.stream_log {
            if let Some(parent) = log.parent() {
                fs::create_dir_all(parent).map_err(|err| anyhow!(err))?;
            }
            let mut body = run.lines.join("\n");
            body.push('\n');
            fs::write(log, body).map_err(|err| anyhow!(err))?;
        }
        for line in &run.lines {
            if line.len() > request.max_line_bytes {
                return Err(InvokeError::Stream(StreamError::LineTooLong {
                    limit: request.max_line_bytes,
                }));
            }
            on_line(line);
            if cancel.is_cancelled() {
                return Ok(AgentExit {
                    reason: ExitReason::Cancelled,
                    exit_code: None,
                    stderr_tail: String::new(),
                });
            }
        }
        Ok(AgentExit::exited(Some(0)))
    }
}
