//! Deterministic classification of one execution attempt.

use crate::core::sentinel::{BlockerDecision, Signal, SignalKind};
use crate::core::stream::StreamSummary;
use crate::core::types::{HardFailure, Outcome, SoftFailure, SoftKind};

/// Durable facts observed after the stream ended.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub stream: &'a StreamSummary,
    /// A summary record for the plan exists on disk.
    pub summary_exists: bool,
    /// The plan's progress record changed during the attempt.
    pub progress_updated: bool,
    pub token_limit: u64,
}

/// Classifier result. A BLOCKED claim is never decided without review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Decided(Outcome),
    NeedsBlockerReview(Signal),
}

/// Classify the attempt, evaluated strictly in order:
/// 1. failure sentinel (BLOCKED routes to review), even when PLAN_COMPLETE was
///    seen in an earlier fragment
/// 2. PLAN_COMPLETE, which requires a summary on disk
/// 3. BAILOUT, resumable only if progress was recorded
/// 4. token usage above the limit
/// 5. no signal at all
pub fn classify(input: &ClassifyInput<'_>) -> Verdict {
    let stream = input.stream;

    if let Some(failure) = &stream.failure {
        if failure.kind == SignalKind::Blocked {
            return Verdict::NeedsBlockerReview(failure.clone());
        }
        return Verdict::Decided(Outcome::Hard(HardFailure {
            kind: failure.kind,
            detail: failure.detail.clone(),
        }));
    }

    if stream.completion.is_some() {
        if input.summary_exists {
            return Verdict::Decided(Outcome::Success);
        }
        return Verdict::Decided(soft(SoftKind::SummaryMissing));
    }

    if stream.bailout.is_some() {
        let kind = if input.progress_updated {
            SoftKind::BailoutResumable
        } else {
            SoftKind::BailoutProgressAtRisk
        };
        return Verdict::Decided(soft(kind));
    }

    if stream.usage.total() > input.token_limit {
        return Verdict::Decided(soft(SoftKind::TokenLimit));
    }

    Verdict::Decided(soft(SoftKind::NoSignal))
}

/// Settle a BLOCKED claim with the verifier's decision.
///
/// A missing or unparseable decision counts as valid, so the loop stops rather
/// than retrying a genuine blocker forever.
pub fn resolve_blocker(signal: &Signal, decision: Option<&BlockerDecision>) -> Outcome {
    match decision {
        Some(BlockerDecision::Invalid { guidance }) => Outcome::Soft(SoftFailure::with_guidance(
            SoftKind::BlockerRejected,
            guidance.clone(),
        )),
        Some(BlockerDecision::Valid { .. }) | None => Outcome::Hard(HardFailure {
            kind: signal.kind,
            detail: signal.detail.clone(),
        }),
    }
}

fn soft(kind: SoftKind) -> Outcome {
    Outcome::Soft(SoftFailure::new(kind))
}
