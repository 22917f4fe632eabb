//! Shared deterministic types for the execution engine.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::sentinel::{Signal, SignalKind};
use crate::core::stream::TokenUsage;

/// A verified, loop-terminating failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardFailure {
    pub kind: SignalKind,
    pub detail: String,
}

/// Why an attempt ended in a recoverable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftKind {
    /// PLAN_COMPLETE without a summary record on disk.
    SummaryMissing,
    /// BAILOUT after the progress record changed.
    BailoutResumable,
    /// BAILOUT without a progress update.
    BailoutProgressAtRisk,
    TokenLimit,
    /// The stream ended without any sentinel.
    NoSignal,
    /// The verifier judged a BLOCKED claim unfounded.
    BlockerRejected,
    /// The agent could not be started or its stream could not be read.
    ExecutionFault,
    /// A plan validation command failed after success.
    ValidationFailed,
}

impl SoftKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SoftKind::SummaryMissing => "summary_missing",
            SoftKind::BailoutResumable => "bailout_resumable",
            SoftKind::BailoutProgressAtRisk => "bailout_progress_at_risk",
            SoftKind::TokenLimit => "token_limit",
            SoftKind::NoSignal => "no_signal",
            SoftKind::BlockerRejected => "blocker_rejected",
            SoftKind::ExecutionFault => "execution_fault",
            SoftKind::ValidationFailed => "validation_failed",
        }
    }

    /// Human-readable reason used in logs and retry prompts.
    pub fn reason(self) -> &'static str {
        match self {
            SoftKind::SummaryMissing => "signaled complete but summary missing",
            SoftKind::BailoutResumable => "bailout with progress preserved",
            SoftKind::BailoutProgressAtRisk => "bailout without a progress update; progress may be lost",
            SoftKind::TokenLimit => "token limit bailout",
            SoftKind::NoSignal => "exited without completion signal",
            SoftKind::BlockerRejected => "blocker claim rejected by verification",
            SoftKind::ExecutionFault => "agent execution failed",
            SoftKind::ValidationFailed => "plan validation command failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftFailure {
    pub kind: SoftKind,
    /// Guidance carried into the next attempt's prompt.
    pub guidance: Option<String>,
}

impl SoftFailure {
    pub fn new(kind: SoftKind) -> Self {
        Self {
            kind,
            guidance: None,
        }
    }

    pub fn with_guidance(kind: SoftKind, guidance: impl Into<String>) -> Self {
        Self {
            kind,
            guidance: Some(guidance.into()),
        }
    }
}

/// Classifier verdict for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Hard(HardFailure),
    Soft(SoftFailure),
}

/// Failure classification stored in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    None,
    Hard,
    Soft,
}

impl Outcome {
    pub fn class(&self) -> FailureClass {
        match self {
            Outcome::Success => FailureClass::None,
            Outcome::Hard(_) => FailureClass::Hard,
            Outcome::Soft(_) => FailureClass::Soft,
        }
    }

    /// Stable label for iteration logs.
    pub fn label(&self) -> String {
        match self {
            Outcome::Success => "success".to_string(),
            Outcome::Hard(failure) => format!("hard:{}", failure.kind.token().to_lowercase()),
            Outcome::Soft(failure) => format!("soft:{}", failure.kind.as_str()),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Hard(failure) if failure.detail.is_empty() => {
                write!(f, "hard failure {}", failure.kind)
            }
            Outcome::Hard(failure) => write!(f, "hard failure {}: {}", failure.kind, failure.detail),
            Outcome::Soft(failure) => write!(f, "soft failure: {}", failure.kind.reason()),
        }
    }
}

/// Per-attempt verdict. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub outcome: Outcome,
    pub duration: Duration,
    pub error: Option<String>,
    /// Bounded tail of the agent's text output.
    pub last_output: String,
    pub usage: TokenUsage,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn failure_class(&self) -> FailureClass {
        self.outcome.class()
    }
}

/// Diagnostics captured when an attempt terminates abnormally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub last_error: String,
    /// Tail of whatever output was captured before the fault.
    pub log_lines: Vec<String>,
    pub last_tool: Option<String>,
    pub failure_signal: Option<Signal>,
    /// Raw stream log left by a previous attempt, when one exists.
    pub fallback_log: Option<String>,
}

impl ExecutionContext {
    pub fn new(last_error: impl Into<String>) -> Self {
        Self {
            last_error: last_error.into(),
            ..Self::default()
        }
    }
}
