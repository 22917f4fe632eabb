//! Agent abstraction for streaming invocations.
//!
//! The [`Agent`] trait decouples orchestration from the actual agent backend
//! (a CLI that emits newline-delimited JSON). Tests use scripted agents that
//! replay predetermined stream lines without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::stream::{StreamParser, StreamSummary};
use crate::io::config::{AgentConfig, EngineConfig};
use crate::io::process::{CancelToken, ExitReason, InvokeError, StreamLimits, run_streaming};

/// Tools granted to plan execution.
pub const EXECUTION_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Grep", "Glob"];
/// Read-only search tools for blocker verification, recovery advice and analysis.
pub const SEARCH_TOOLS: &[&str] = &["Read", "Grep", "Glob"];
/// Tools for repairing a single ledger file.
pub const REPAIR_TOOLS: &[&str] = &["Read", "Edit"];

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    pub prompt: String,
    pub model: String,
    pub allowed_tools: Vec<String>,
    /// Files referenced in the prompt so the agent loads them up front.
    pub context_files: Vec<PathBuf>,
    pub timeout: Duration,
    pub inactivity_timeout: Duration,
    pub max_line_bytes: usize,
    /// Where to tee the raw stream, when set.
    pub stream_log: Option<PathBuf>,
}

impl AgentRequest {
    pub fn new(workdir: PathBuf, prompt: String, model: &str, tools: &[&str], config: &EngineConfig) -> Self {
        Self {
            workdir,
            prompt,
            model: model.to_string(),
            allowed_tools: tools.iter().map(|tool| (*tool).to_string()).collect(),
            context_files: Vec::new(),
            timeout: config.attempt_timeout(),
            inactivity_timeout: config.inactivity_timeout(),
            max_line_bytes: config.max_line_bytes,
            stream_log: None,
        }
    }

    pub fn with_context_files(mut self, files: Vec<PathBuf>) -> Self {
        self.context_files = files;
        self
    }

    pub fn with_stream_log(mut self, path: PathBuf) -> Self {
        self.stream_log = Some(path);
        self
    }

    /// Prompt with preloaded files referenced as `@path` lines.
    pub fn full_prompt(&self) -> String {
        if self.context_files.is_empty() {
            return self.prompt.clone();
        }
        let mut prompt = self.prompt.clone();
        prompt.push_str("\n\n");
        for file in &self.context_files {
            prompt.push('@');
            prompt.push_str(&file.display().to_string());
            prompt.push('\n');
        }
        prompt
    }
}

/// How an invocation ended, independent of what the stream said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExit {
    pub reason: ExitReason,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

impl AgentExit {
    pub fn exited(exit_code: Option<i32>) -> Self {
        Self {
            reason: ExitReason::Exited,
            exit_code,
            stderr_tail: String::new(),
        }
    }
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run the agent, handing each stdout line to `on_line` as it arrives. The
    /// invocation stops early once `cancel` is tripped.
    fn invoke(
        &self,
        request: &AgentRequest,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<AgentExit, InvokeError>;
}

/// Agent that spawns a Claude-style CLI in streaming JSON mode.
#[derive(Debug, Clone)]
pub struct CliAgent {
    command: String,
    args: Vec<String>,
}

impl CliAgent {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&request.model);
        if !request.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(request.allowed_tools.join(","));
        }
        cmd.args(&self.args).current_dir(&request.workdir);
        cmd
    }
}

impl Agent for CliAgent {
    #[instrument(skip_all, fields(model = %request.model, timeout_secs = request.timeout.as_secs(), streaming = request.stream_log.is_some()))]
    fn invoke(
        &self,
        request: &AgentRequest,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<AgentExit, InvokeError> {
        info!(workdir = %request.workdir.display(), command = %self.command, "starting agent");
        let prompt = request.full_prompt();
        let limits = StreamLimits {
            deadline: request.timeout,
            inactivity: request.inactivity_timeout,
            max_line_bytes: request.max_line_bytes,
            stderr_limit_bytes: 64 * 1024,
        };
        let output = run_streaming(
            self.command(request),
            Some(prompt.as_bytes()),
            limits,
            request.stream_log.as_deref(),
            cancel,
            on_line,
        )?;

        let exit_code = output.status.and_then(|status| status.code());
        if output.reason == ExitReason::Exited && exit_code != Some(0) {
            warn!(exit_code = ?exit_code, "agent exited with failure status");
        }
        debug!(reason = output.reason.as_str(), lines = output.lines, "agent finished");
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(AgentExit {
            reason: output.reason,
            exit_code,
            stderr_tail: tail(&stderr, 4096),
        })
    }
}

fn tail(text: &str, limit: usize) -> String {
    let mut out = String::new();
    crate::core::stream::push_tail(&mut out, text.trim_end(), limit);
    out
}

/// Result of running an agent through the stream parser.
#[derive(Debug)]
pub struct ParsedRun {
    pub stream: StreamSummary,
    pub exit: AgentExit,
}

/// Invoke `agent` and parse its stream. With `stop_on_signal`, the first failure
/// or bailout sentinel cancels the invocation; otherwise the stream is read to
/// completion. `collect_text` keeps the full text for later decoding.
pub fn run_parsed<A: Agent + ?Sized>(
    agent: &A,
    request: &AgentRequest,
    tail_bytes: usize,
    stop_on_signal: bool,
    collect_text: bool,
) -> Result<ParsedRun, InvokeError> {
    let cancel = CancelToken::new();
    let trip = cancel.clone();
    let mut parser = StreamParser::new(tail_bytes);
    if stop_on_signal {
        parser = parser.with_cancel(move |signal| {
            debug!(kind = %signal.kind, "terminal sentinel, cancelling agent");
            trip.cancel();
        });
    }
    if collect_text {
        parser = parser.collect_text();
    }
    let exit = agent.invoke(request, &cancel, &mut |line| parser.feed_line(line))?;
    Ok(ParsedRun {
        stream: parser.finish(),
        exit,
    })
}
