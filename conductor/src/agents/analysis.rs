//! Post-execution analysis: reviews an attempt and reports observations.

use std::path::PathBuf;

use tracing::{info, instrument, warn};

use crate::core::observation::{DecodedObservations, decode_observations};
use crate::core::records::Plan;
use crate::io::agent::{Agent, AgentRequest, SEARCH_TOOLS, run_parsed};
use crate::io::config::EngineConfig;
use crate::io::paths::LedgerPaths;
use crate::io::prompt::render_analysis;

#[derive(Debug, Clone)]
pub struct Analyst {
    paths: LedgerPaths,
    config: EngineConfig,
}

impl Analyst {
    pub fn new(paths: LedgerPaths, config: EngineConfig) -> Self {
        Self { paths, config }
    }

    /// Run the analysis to completion (no early cancellation) and decode its
    /// observation blocks. Failures degrade to no observations.
    #[instrument(skip_all, fields(plan = %format!("{}-{}", plan.phase, plan.plan), outcome))]
    pub fn run<A: Agent + ?Sized>(
        &self,
        agent: &A,
        plan: &Plan,
        outcome: &str,
        last_output: &str,
        stream_log: PathBuf,
    ) -> DecodedObservations {
        let plan_id = plan
            .id()
            .map_or_else(|| format!("{}-{}", plan.phase, plan.plan), |id| id.to_string());
        let prompt = match render_analysis(&plan_id, &plan.objective, outcome, last_output) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %err, "failed to render analysis prompt");
                return DecodedObservations::default();
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
                warn!(err = %err, "analysis failed to run");
                return DecodedObservations::default();
            }
        };
        let decoded = decode_observations(run.stream.collected_text().unwrap_or_default());
        for rejected in &decoded.rejected {
            warn!(reason = %rejected.reason, "skipping malformed observation block");
        }
        info!(
            observations = decoded.observations.len(),
            rejected = decoded.rejected.len(),
            "analysis complete"
        );
        decoded
    }
}
