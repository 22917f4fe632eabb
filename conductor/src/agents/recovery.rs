//! Recovery advisor for process-level failures.
//!
//! Advice is never applied automatically; its guidance text is handed to the
//! next attempt.

use std::path::PathBuf;

use tracing::{info, instrument, warn};

use crate::core::plan_number::PlanId;
use crate::core::sentinel::{RecoveryAdvice, parse_recovery_advice};
use crate::core::types::ExecutionContext;
use crate::io::agent::{Agent, AgentRequest, SEARCH_TOOLS, run_parsed};
use crate::io::config::EngineConfig;
use crate::io::paths::LedgerPaths;
use crate::io::prompt::render_recovery;

#[derive(Debug, Clone)]
pub struct RecoveryAdvisor {
    paths: LedgerPaths,
    config: EngineConfig,
}

impl RecoveryAdvisor {
    pub fn new(paths: LedgerPaths, config: EngineConfig) -> Self {
        Self { paths, config }
    }

    #[instrument(skip_all, fields(plan = %plan))]
    pub fn run<A: Agent + ?Sized>(
        &self,
        agent: &A,
        plan: &PlanId,
        context: &ExecutionContext,
        stream_log: PathBuf,
    ) -> Option<RecoveryAdvice> {
        let prompt = match render_recovery(&plan.to_string(), context) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %err, "failed to render recovery prompt");
                return None;
            }
        };
        let request = AgentRequest::new(
            self.paths.root().to_path_buf(),
            prompt,
            &self.config.agent.advisory_model,
            SEARCH_TOOLS,
            &self.config,
        )
        .with_stream_log(stream_log);

        let run = match run_parsed(agent, &request, self.config.output_tail_bytes, false, true) {
            Ok(run) => run,
            Err(err) => {
                warn!(err = %err, "recovery advisor failed to run");
                return None;
            }
        };
        let advice = run.stream.collected_text().and_then(parse_recovery_advice);
        match &advice {
            Some(advice) => info!(action = advice.action.as_str(), "recovery advice received"),
            None => warn!("recovery advisor gave no recognizable action"),
        }
        advice
    }
}
