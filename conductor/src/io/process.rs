//! Helpers for running child processes with timeouts and bounded output.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::stream::{LineReader, StreamError};

/// Upper bound on how long the caller thread blocks between watchdog checks.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Grace period for the child to exit after its stdout closed.
const EXIT_GRACE: Duration = Duration::from_secs(10);
/// How long to wait for stderr after the child was killed. Grandchildren may hold the pipe open.
const STDERR_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.stdout_truncated + self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[output truncated {} bytes]\n",
                self.stdout_truncated + self.stderr_truncated
            ));
        }
        text
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Shared cooperative cancellation flag for one streaming invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Failures of a streaming agent invocation.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The process could not be started.
    #[error("failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Time and size bounds for a streaming invocation.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub deadline: Duration,
    /// Kill the child when no stdout line arrives within this window.
    pub inactivity: Duration,
    pub max_line_bytes: usize,
    pub stderr_limit_bytes: usize,
}

/// Why a streaming child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Stdout closed and the child exited on its own.
    Exited,
    Cancelled,
    TimedOut,
    IdleTimeout,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::Exited => "exited",
            ExitReason::Cancelled => "cancelled",
            ExitReason::TimedOut => "timed_out",
            ExitReason::IdleTimeout => "idle_timeout",
        }
    }
}

#[derive(Debug)]
pub struct StreamingOutput {
    pub reason: ExitReason,
    pub status: Option<ExitStatus>,
    pub stderr: Vec<u8>,
    pub stderr_truncated: usize,
    pub lines: usize,
}

enum ReaderMsg {
    Line(String),
    Failed(StreamError),
}

/// Run a child whose stdout is a line stream, handing each line to `on_line` as it arrives.
///
/// A background thread reads stdout with a growable buffer and forwards lines over a
/// channel; the calling thread enforces the deadline, the inactivity watchdog and
/// `cancel`, which `on_line` may trip to stop the child early. When `tee` is set, the
/// raw stream is also written there line by line.
#[instrument(skip_all, fields(deadline_secs = limits.deadline.as_secs(), inactivity_secs = limits.inactivity.as_secs(), tee = tee.is_some()))]
pub fn run_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: StreamLimits,
    tee: Option<&Path>,
    cancel: &CancelToken,
    on_line: &mut dyn FnMut(&str),
) -> Result<StreamingOutput, InvokeError> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(program = %program, "spawning streaming child");
    let mut child = cmd.spawn().map_err(|source| {
        error!(program = %program, err = %source, "failed to spawn command");
        InvokeError::Spawn {
            program: program.clone(),
            source,
        }
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let tee_writer = match tee {
        Some(path) => Some(open_tee(path)?),
        None => None,
    };

    let (tx, rx) = mpsc::channel();
    let max_line_bytes = limits.max_line_bytes;
    let reader_handle = thread::spawn(move || {
        let mut reader = LineReader::new(BufReader::new(stdout), max_line_bytes);
        let mut tee_writer = tee_writer;
        loop {
            match reader.next_line() {
                Ok(Some(line)) => {
                    if let Some(writer) = tee_writer.as_mut() {
                        let written = writer
                            .write_all(line.as_bytes())
                            .and_then(|()| writer.write_all(b"\n"))
                            .and_then(|()| writer.flush());
                        if let Err(err) = written {
                            warn!(err = %err, "failed to write stream tee");
                            tee_writer = None;
                        }
                    }
                    if tx.send(ReaderMsg::Line(line)).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    let _ = tx.send(ReaderMsg::Failed(err));
                    return;
                }
            }
        }
    });
    let stderr_limit = limits.stderr_limit_bytes;
    let (stderr_tx, stderr_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = stderr_tx.send(read_stream_limited(stderr, stderr_limit));
    });

    // Written from its own thread so a child echoing its input cannot fill stdout
    // while we are still blocked on stdin.
    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        thread::spawn(move || {
            if let Err(err) = child_stdin.write_all(&input) {
                warn!(err = %err, "failed to write child stdin");
            }
        });
    }

    let started = Instant::now();
    let mut last_line = started;
    let mut lines = 0usize;
    let mut stream_error = None;
    let reason = loop {
        if cancel.is_cancelled() {
            break ExitReason::Cancelled;
        }
        let now = Instant::now();
        let deadline_left = limits.deadline.saturating_sub(now - started);
        let idle_left = limits.inactivity.saturating_sub(now - last_line);
        if deadline_left.is_zero() {
            break ExitReason::TimedOut;
        }
        if idle_left.is_zero() {
            break ExitReason::IdleTimeout;
        }
        match rx.recv_timeout(deadline_left.min(idle_left).min(POLL_INTERVAL)) {
            Ok(ReaderMsg::Line(line)) => {
                last_line = Instant::now();
                lines += 1;
                on_line(&line);
            }
            Ok(ReaderMsg::Failed(err)) => {
                stream_error = Some(err);
                break ExitReason::Cancelled;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break ExitReason::Exited,
        }
    };

    let status = if reason == ExitReason::Exited {
        if reader_handle.join().is_err() {
            warn!("stream reader thread panicked");
        }
        match child.wait_timeout(EXIT_GRACE).context("wait for child")? {
            Some(status) => Some(status),
            None => {
                warn!("child kept running after closing stdout, killing");
                kill_quietly(&mut child)
            }
        }
    } else {
        match reason {
            ExitReason::TimedOut => warn!(
                deadline_secs = limits.deadline.as_secs(),
                "streaming child timed out, killing"
            ),
            ExitReason::IdleTimeout => warn!(
                inactivity_secs = limits.inactivity.as_secs(),
                "no output within inactivity window, killing"
            ),
            _ => debug!("stopping streaming child early"),
        }
        // The reader thread may be blocked on a pipe held open by grandchildren; it is
        // left to finish on its own once the pipe closes.
        drop(reader_handle);
        kill_quietly(&mut child)
    };

    let stderr_wait = if reason == ExitReason::Exited {
        EXIT_GRACE
    } else {
        STDERR_GRACE
    };
    let (stderr, stderr_truncated) = match stderr_rx.recv_timeout(stderr_wait) {
        Ok(captured) => captured.context("read stderr")?,
        Err(_) => {
            warn!(
                wait_secs = stderr_wait.as_secs(),
                "stderr still open after the child stopped, leaving it behind"
            );
            (Vec::new(), 0)
        }
    };

    if let Some(err) = stream_error {
        warn!(err = %err, lines, "agent stream failed");
        return Err(InvokeError::Stream(err));
    }

    debug!(exit_code = ?status.and_then(|s| s.code()), reason = reason.as_str(), lines, "streaming child finished");
    Ok(StreamingOutput {
        reason,
        status,
        stderr,
        stderr_truncated,
        lines,
    })
}

fn open_tee(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create stream file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn kill_quietly(child: &mut Child) -> Option<ExitStatus> {
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill failed, child likely already exited");
    }
    child.wait().ok()
}
