//! Sentinel tokens embedded in agent output.
//!
//! Grammar: `###TOKEN###` or `###TOKEN:detail###`. The detail runs up to the
//! closing `###` and may itself contain colons. Sentinels are the only
//! machine-actionable signals in the stream; everything else is prose.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static SENTINEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"###(PLAN_COMPLETE|BAILOUT|PLAN_FAILED|TASK_FAILED|BUILD_FAILED|TEST_FAILED|BLOCKED)(?::(.*?))?###",
    )
    .expect("sentinel regex is valid")
});

static BLOCKER_DECISION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)###BLOCKER_(VALID|INVALID)(?::(.*?))?###").expect("blocker regex is valid")
});

static RECOVERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)###RECOVERY:([a-z_-]+)(?::(.*?))?###").expect("recovery regex is valid")
});

/// Terminal signal kinds the executor agent can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    PlanComplete,
    Bailout,
    PlanFailed,
    TaskFailed,
    BuildFailed,
    TestFailed,
    Blocked,
}

impl SignalKind {
    pub fn token(self) -> &'static str {
        match self {
            SignalKind::PlanComplete => "PLAN_COMPLETE",
            SignalKind::Bailout => "BAILOUT",
            SignalKind::PlanFailed => "PLAN_FAILED",
            SignalKind::TaskFailed => "TASK_FAILED",
            SignalKind::BuildFailed => "BUILD_FAILED",
            SignalKind::TestFailed => "TEST_FAILED",
            SignalKind::Blocked => "BLOCKED",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "PLAN_COMPLETE" => SignalKind::PlanComplete,
            "BAILOUT" => SignalKind::Bailout,
            "PLAN_FAILED" => SignalKind::PlanFailed,
            "TASK_FAILED" => SignalKind::TaskFailed,
            "BUILD_FAILED" => SignalKind::BuildFailed,
            "TEST_FAILED" => SignalKind::TestFailed,
            "BLOCKED" => SignalKind::Blocked,
            _ => return None,
        })
    }

    pub fn is_failure(self) -> bool {
        !matches!(self, SignalKind::PlanComplete | SignalKind::Bailout)
    }

    /// Signals after which the agent should be stopped early.
    pub fn stops_execution(self) -> bool {
        self != SignalKind::PlanComplete
    }

    /// Lower wins when several sentinels share one fragment: explicit success and
    /// bailout are not masked by failure tokens quoted in trailing discussion.
    fn priority(self) -> u8 {
        match self {
            SignalKind::Bailout => 0,
            SignalKind::PlanComplete => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A parsed sentinel: kind plus verbatim detail (empty when absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub detail: String,
}

/// Every sentinel in `text`, in order of appearance.
pub fn scan_signals(text: &str) -> Vec<Signal> {
    SENTINEL_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let kind = SignalKind::from_token(caps.get(1)?.as_str())?;
            let detail = caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Some(Signal { kind, detail })
        })
        .collect()
}

/// The sentinel that decides a single fragment.
///
/// Bailout and completion outrank failures; among equals the first occurrence wins.
/// This ordering is per fragment only. Across a stream the parser keeps the first
/// signal of each category, and the classifier lets a captured failure override a
/// completion reported in an earlier fragment: a later failure retracts the claim.
pub fn decisive_signal(text: &str) -> Option<Signal> {
    scan_signals(text)
        .into_iter()
        .enumerate()
        .min_by_key(|(index, signal)| (signal.kind.priority(), *index))
        .map(|(_, signal)| signal)
}

/// Verdict emitted by the blocker verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockerDecision {
    Valid { reason: String },
    Invalid { guidance: String },
}

/// First blocker decision sentinel in `text`, if any.
pub fn parse_blocker_decision(text: &str) -> Option<BlockerDecision> {
    let caps = BLOCKER_DECISION_RE.captures(text)?;
    let detail = caps
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    match caps.get(1)?.as_str() {
        "VALID" => Some(BlockerDecision::Valid { reason: detail }),
        "INVALID" => Some(BlockerDecision::Invalid { guidance: detail }),
        _ => None,
    }
}

/// Action recommended by the recovery advisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    FixState,
    BreakIntoChunks,
    Skip,
    ManualIntervention,
}

impl RecoveryAction {
    fn from_token(token: &str) -> Option<Self> {
        Some(match token.replace('-', "_").as_str() {
            "retry" => RecoveryAction::Retry,
            "fix_state" => RecoveryAction::FixState,
            "break_into_chunks" => RecoveryAction::BreakIntoChunks,
            "skip" => RecoveryAction::Skip,
            "manual_intervention" => RecoveryAction::ManualIntervention,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::FixState => "fix_state",
            RecoveryAction::BreakIntoChunks => "break_into_chunks",
            RecoveryAction::Skip => "skip",
            RecoveryAction::ManualIntervention => "manual_intervention",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAdvice {
    pub action: RecoveryAction,
    pub guidance: String,
}

/// First well-formed `###RECOVERY:<action>:<guidance>###` in `text`.
pub fn parse_recovery_advice(text: &str) -> Option<RecoveryAdvice> {
    RECOVERY_RE.captures_iter(text).find_map(|caps| {
        let action = RecoveryAction::from_token(caps.get(1)?.as_str())?;
        let guidance = caps
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        Some(RecoveryAdvice { action, guidance })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_token_and_detail_verbatim() {
        let signals = scan_signals("Tests failed ###PLAN_FAILED:test_infrastructure### see log");
        assert_eq!(
            signals,
            vec![Signal {
                kind: SignalKind::PlanFailed,
                detail: "test_infrastructure".to_string(),
            }]
        );
    }

    #[test]
    fn detail_keeps_inner_colons() {
        let signal = decisive_signal("###BLOCKED:needs creds: AWS_KEY: not set###").expect("signal");
        assert_eq!(signal.kind, SignalKind::Blocked);
        assert_eq!(signal.detail, "needs creds: AWS_KEY: not set");
    }

    #[test]
    fn bare_token_has_empty_detail() {
        let signal = decisive_signal("all done ###PLAN_COMPLETE###").expect("signal");
        assert_eq!(signal.kind, SignalKind::PlanComplete);
        assert_eq!(signal.detail, "");
    }

    #[test]
    fn completion_outranks_failure_in_same_fragment() {
        let text = "###PLAN_COMPLETE### Earlier the run printed ###TEST_FAILED:flaky### but it was fixed";
        assert_eq!(
            decisive_signal(text).expect("signal").kind,
            SignalKind::PlanComplete
        );
        let text = "###TEST_FAILED:x### then ###BAILOUT:context###";
        assert_eq!(decisive_signal(text).expect("signal").kind, SignalKind::Bailout);
    }

    #[test]
    fn unknown_tokens_and_prose_are_ignored() {
        assert!(decisive_signal("###SOMETHING_ELSE### and plan_complete").is_none());
        assert!(decisive_signal("#PLAN_COMPLETE#").is_none());
    }

    #[test]
    fn blocker_decisions_parse() {
        assert_eq!(
            parse_blocker_decision("checked history ###BLOCKER_INVALID:use the mock server### ok"),
            Some(BlockerDecision::Invalid {
                guidance: "use the mock server".to_string()
            })
        );
        assert_eq!(
            parse_blocker_decision("###BLOCKER_VALID:no credentials anywhere###"),
            Some(BlockerDecision::Valid {
                reason: "no credentials anywhere".to_string()
            })
        );
        assert_eq!(parse_blocker_decision("I think it's valid"), None);
    }

    #[test]
    fn recovery_advice_parses_action_and_guidance() {
        let advice = parse_recovery_advice("###RECOVERY:break-into-chunks:split task 3: too big###")
            .expect("advice");
        assert_eq!(advice.action, RecoveryAction::BreakIntoChunks);
        assert_eq!(advice.guidance, "split task 3: too big");
        assert!(parse_recovery_advice("###RECOVERY:explode:now###").is_none());
    }
}
