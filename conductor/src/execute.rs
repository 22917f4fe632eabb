//! One execution attempt of a plan.
//!
//! Runs the agent, classifies the stream, routes BLOCKED claims to the
//! verifier, runs the validation gate on success and finally the analysis
//! pass. Process-level faults become soft failures carrying recovery advice.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agents::analysis::Analyst;
use crate::agents::blocker::BlockerVerifier;
use crate::agents::plan_executor::PlanExecutor;
use crate::agents::recovery::RecoveryAdvisor;
use crate::agents::repair::RepairAgent;
use crate::core::classifier::{ClassifyInput, Verdict, classify, resolve_blocker};
use crate::core::plan_number::PlanId;
use crate::core::records::Plan;
use crate::core::stream::{TokenUsage, parse_stream, push_tail};
use crate::core::types::{ExecutionContext, Outcome, RunResult, SoftFailure, SoftKind};
use crate::error::EngineError;
use crate::heal::load_healed;
use crate::io::agent::{Agent, AgentExit};
use crate::io::config::EngineConfig;
use crate::io::guards::{
    DEFAULT_OUTPUT_LIMIT_BYTES, GateOutcome, GateRequest, GateRunner, run_gate_if_needed,
};
use crate::io::iteration_log::{IterationPaths, latest_stream_log};
use crate::io::ledger::{Ledger, LedgerError, LedgerResult};
use crate::io::paths::LedgerPaths;
use crate::io::process::{ExitReason, InvokeError};

/// Raw stream lines kept in an [`ExecutionContext`].
const CONTEXT_LOG_LINES: usize = 40;

/// Everything one workspace run needs: ledger, config, agent and gate runner.
pub struct Engine<'a, A: ?Sized, G: ?Sized> {
    ledger: Ledger,
    config: EngineConfig,
    agent: &'a A,
    gate: &'a G,
    executor: PlanExecutor,
    verifier: BlockerVerifier,
    advisor: RecoveryAdvisor,
    analyst: Analyst,
    repairer: RepairAgent,
}

impl<'a, A: Agent + ?Sized, G: GateRunner + ?Sized> Engine<'a, A, G> {
    pub fn new(root: &Path, config: EngineConfig, agent: &'a A, gate: &'a G) -> Self {
        let paths = LedgerPaths::new(root);
        Self {
            ledger: Ledger::new(paths.clone()),
            executor: PlanExecutor::new(paths.clone(), config.clone()),
            verifier: BlockerVerifier::new(paths.clone(), config.clone()),
            advisor: RecoveryAdvisor::new(paths.clone(), config.clone()),
            analyst: Analyst::new(paths.clone(), config.clone()),
            repairer: RepairAgent::new(paths, config.clone()),
            config,
            agent,
            gate,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn agent(&self) -> &A {
        self.agent
    }

    pub fn repairer(&self) -> &RepairAgent {
        &self.repairer
    }

    /// Repair attempts allowed per file. Unset falls back to the iteration budget.
    pub fn heal_cap(&self) -> u32 {
        self.config
            .self_heal_max_attempts
            .unwrap_or(self.config.max_iterations)
    }

    /// Load a record, repairing invalid files on the way.
    pub fn load_healed<T>(
        &self,
        stream_dir: Option<&Path>,
        load: impl FnMut() -> LedgerResult<T>,
    ) -> Result<T, EngineError> {
        load_healed(
            self.agent,
            &self.repairer,
            Some(self.heal_cap()),
            stream_dir,
            load,
        )
    }

    /// Run one attempt of `plan` and classify it.
    #[instrument(skip_all, fields(plan = %format!("{}-{}", plan.phase, plan.plan), iter))]
    pub fn attempt(
        &self,
        plan: &Plan,
        guidance: Option<&str>,
        iter: u32,
    ) -> Result<RunResult, EngineError> {
        let id = plan_id(plan)?;
        let paths = IterationPaths::new(self.ledger.paths().iteration_dir(iter));
        let started = Instant::now();
        let progress_before = self.ledger.progress_text(&id)?;

        let run = match self
            .executor
            .run(self.agent, plan, guidance, paths.stream_path.clone())
        {
            Ok(run) => run,
            Err(err) => return Ok(self.process_fault(&id, &err, iter, &paths, started)),
        };

        let progress_after = self.ledger.progress_text(&id)?;
        let progress_updated = progress_after.is_some() && progress_after != progress_before;
        let stream = &run.stream;
        let verdict = classify(&ClassifyInput {
            stream,
            summary_exists: self.ledger.has_valid_summary(&id),
            progress_updated,
            token_limit: self.config.token_limit,
        });
        let mut outcome = match verdict {
            Verdict::Decided(outcome) => outcome,
            Verdict::NeedsBlockerReview(signal) => {
                let decision = self.verifier.run(
                    self.agent,
                    &id,
                    &signal,
                    &stream.last_output,
                    paths.advisory_stream("blocker"),
                );
                resolve_blocker(&signal, decision.as_ref())
            }
        };
        if outcome == Outcome::Success {
            outcome = self.validation_gate(plan, &paths)?;
        }
        info!(
            outcome = %outcome.label(),
            lines = stream.lines,
            tokens = stream.usage.total(),
            "attempt classified"
        );

        if self.config.analysis {
            let decoded = self.analyst.run(
                self.agent,
                plan,
                &outcome.label(),
                &stream.last_output,
                paths.analysis_path.clone(),
            );
            match self
                .ledger
                .append_observations(&id, decoded.observations, Utc::now())
            {
                Ok(()) => {}
                Err(LedgerError::Invalid { report, .. }) => {
                    warn!(errors = report.errors.len(), "observations rejected by schema");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(RunResult {
            outcome,
            duration: started.elapsed(),
            error: exit_error(&run.exit),
            last_output: stream.last_output.clone(),
            usage: stream.usage,
        })
    }

    fn validation_gate(&self, plan: &Plan, paths: &IterationPaths) -> Result<Outcome, EngineError> {
        let request = GateRequest {
            workdir: self.ledger.paths().root().to_path_buf(),
            commands: plan.validation.clone().unwrap_or_default(),
            log_path: paths.validation_log_path.clone(),
            timeout: self.config.validation_timeout(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            tail_bytes: self.config.output_tail_bytes,
        };
        Ok(
            match run_gate_if_needed(self.config.run_validation, self.gate, &request)? {
                GateOutcome::Pass | GateOutcome::Skipped => Outcome::Success,
                GateOutcome::Fail {
                    command,
                    output_tail,
                } => Outcome::Soft(SoftFailure::with_guidance(
                    SoftKind::ValidationFailed,
                    format!(
                        "The plan was signaled complete but its validation command `{command}` failed. \
                         Fix the cause, update the summary, then signal completion again.\n\n{output_tail}"
                    ),
                )),
            },
        )
    }

    /// Build diagnostics for a fault and ask the advisor what to do next.
    fn process_fault(
        &self,
        id: &PlanId,
        err: &InvokeError,
        iter: u32,
        paths: &IterationPaths,
        started: Instant,
    ) -> RunResult {
        let last_error = error_chain(err);
        warn!(err = %last_error, "agent execution failed");

        let mut context = ExecutionContext::new(last_error.clone());
        if let Some(partial) = read_tail(&paths.stream_path, self.config.output_tail_bytes) {
            let summary = parse_stream(&partial, self.config.output_tail_bytes);
            context.last_tool = summary.last_tool;
            context.failure_signal = summary.failure.or(summary.bailout);
            context.log_lines = last_lines(&partial, CONTEXT_LOG_LINES);
        }
        context.fallback_log = latest_stream_log(&self.ledger.paths().iterations_dir(), iter)
            .and_then(|path| read_tail(&path, self.config.output_tail_bytes));

        let advice = self.advisor.run(
            self.agent,
            id,
            &context,
            paths.advisory_stream("recovery"),
        );
        let mut guidance = format!("The previous attempt could not run to completion: {last_error}.");
        if let Some(advice) = &advice {
            guidance.push_str(&format!(
                "\nRecovery advice ({}): {}",
                advice.action.as_str(),
                advice.guidance
            ));
        }

        let mut last_output = String::new();
        push_tail(
            &mut last_output,
            &context.log_lines.join("\n"),
            self.config.output_tail_bytes,
        );
        RunResult {
            outcome: Outcome::Soft(SoftFailure::with_guidance(SoftKind::ExecutionFault, guidance)),
            duration: started.elapsed(),
            error: Some(last_error),
            last_output,
            usage: TokenUsage::default(),
        }
    }
}

pub(crate) fn plan_id(plan: &Plan) -> Result<PlanId, EngineError> {
    plan.id().ok_or_else(|| {
        EngineError::Other(anyhow::anyhow!(
            "plan {}-{} has an invalid number",
            plan.phase,
            plan.plan
        ))
    })
}

fn exit_error(exit: &AgentExit) -> Option<String> {
    match exit.reason {
        ExitReason::Cancelled => None,
        ExitReason::Exited => exit
            .exit_code
            .filter(|code| *code != 0)
            .map(|code| format!("agent exited with code {code}")),
        ExitReason::TimedOut | ExitReason::IdleTimeout => {
            Some(format!("agent stopped: {}", exit.reason.as_str()))
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// Last `limit` bytes of a file, lossily decoded.
fn read_tail(path: &Path, limit: usize) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let limit = u64::try_from(limit).unwrap_or(u64::MAX);
    if len > limit {
        file.seek(SeekFrom::Start(len - limit)).ok()?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn last_lines(text: &str, count: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let skip = lines.len().saturating_sub(count);
    lines[skip..].iter().map(|line| (*line).to_string()).collect()
}
