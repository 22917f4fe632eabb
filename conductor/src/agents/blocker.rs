//! Blocker verifier: a read-only second opinion on BLOCKED claims.

use std::path::PathBuf;

use tracing::{info, instrument, warn};

use crate::core::plan_number::PlanId;
use crate::core::sentinel::{BlockerDecision, Signal, parse_blocker_decision};
use crate::io::agent::{Agent, AgentRequest, SEARCH_TOOLS, run_parsed};
use crate::io::config::EngineConfig;
use crate::io::paths::LedgerPaths;
use crate::io::prompt::render_blocker;

use super::display_path;

#[derive(Debug, Clone)]
pub struct BlockerVerifier {
    paths: LedgerPaths,
    config: EngineConfig,
}

impl BlockerVerifier {
    pub fn new(paths: LedgerPaths, config: EngineConfig) -> Self {
        Self { paths, config }
    }

    /// Ask the verifier for a decision. `None` when it could not run or gave no
    /// recognizable decision; the caller treats that as a valid blocker.
    #[instrument(skip_all, fields(plan = %plan))]
    pub fn run<A: Agent + ?Sized>(
        &self,
        agent: &A,
        plan: &PlanId,
        signal: &Signal,
        last_output: &str,
        stream_log: PathBuf,
    ) -> Option<BlockerDecision> {
        let root = self.paths.root();
        let prompt = match render_blocker(
            &plan.to_string(),
            &signal.detail,
            last_output,
            &display_path(root, self.paths.planning_dir()),
        ) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %err, "failed to render blocker prompt");
                return None;
            }
        };
        let request = AgentRequest::new(
            root.to_path_buf(),
            prompt,
            &self.config.agent.advisory_model,
            SEARCH_TOOLS,
            &self.config,
        )
        .with_stream_log(stream_log);

        let run = match run_parsed(agent, &request, self.config.output_tail_bytes, false, true) {
            Ok(run) => run,
            Err(err) => {
                warn!(err = %err, "blocker verification failed to run");
                return None;
            }
        };
        let decision = run.stream.collected_text().and_then(parse_blocker_decision);
        match &decision {
            Some(BlockerDecision::Valid { reason }) => info!(reason = %reason, "blocker confirmed"),
            Some(BlockerDecision::Invalid { guidance }) => {
                info!(guidance = %guidance, "blocker rejected");
            }
            None => warn!("verifier gave no decision, treating blocker as valid"),
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sentinel::SignalKind;
    use crate::test_support::{ScriptedAgent, result_line};

    fn signal() -> Signal {
        Signal {
            kind: SignalKind::Blocked,
            detail: "staging database unreachable".to_string(),
        }
    }

    fn verifier(root: &std::path::Path) -> BlockerVerifier {
        BlockerVerifier::new(LedgerPaths::new(root), EngineConfig::default())
    }

    #[test]
    fn invalid_decision_carries_guidance() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedAgent::new(vec![vec![result_line(
            "Found fixtures.\n###BLOCKER_INVALID:use tests/fixtures/db.sql instead###",
        )]]);
        let plan = PlanId::parse("01-02").expect("id");
        let decision = verifier(temp.path()).run(&agent, &plan, &signal(), "", temp.path().join("b.jsonl"));
        assert_eq!(
            decision,
            Some(BlockerDecision::Invalid {
                guidance: "use tests/fixtures/db.sql instead".to_string()
            })
        );
        let request = &agent.requests()[0];
        assert!(request.prompt.contains("staging database unreachable"));
        assert!(request.allowed_tools.iter().all(|tool| tool != "Edit"));
    }

    #[test]
    fn missing_decision_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedAgent::new(vec![vec![result_line("I am not sure.")]]);
        let plan = PlanId::parse("01-02").expect("id");
        let v = verifier(temp.path());
        assert!(v.run(&agent, &plan, &signal(), "", temp.path().join("b.jsonl")).is_none());
    }
}
