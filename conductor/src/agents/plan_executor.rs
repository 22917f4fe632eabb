//! Executor agent for performing the work of one plan.

use std::path::PathBuf;

use tracing::instrument;

use crate::core::records::Plan;
use crate::io::agent::{Agent, AgentRequest, EXECUTION_TOOLS, ParsedRun, run_parsed};
use crate::io::config::EngineConfig;
use crate::io::paths::LedgerPaths;
use crate::io::process::InvokeError;
use crate::io::prompt::{ExecutePrompt, PlanPaths, render_execute};

use super::display_path;

/// Executor wrapper that owns prompt and invocation settings.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    paths: LedgerPaths,
    config: EngineConfig,
}

impl PlanExecutor {
    pub fn new(paths: LedgerPaths, config: EngineConfig) -> Self {
        Self { paths, config }
    }

    /// Build the request for `plan`; exposed so callers can inspect it.
    pub fn request(
        &self,
        plan: &Plan,
        guidance: Option<&str>,
        stream_log: PathBuf,
    ) -> Result<AgentRequest, InvokeError> {
        let id = plan
            .id()
            .ok_or_else(|| anyhow::anyhow!("plan {}-{} has an invalid number", plan.phase, plan.plan))?;
        let root = self.paths.root();
        let plan_path = self.paths.plan(&id);
        let progress_path = self.paths.progress(&id);
        let prompt = render_execute(&ExecutePrompt {
            plan,
            paths: PlanPaths {
                plan: display_path(root, &plan_path),
                progress: display_path(root, &progress_path),
                summary: display_path(root, &self.paths.summary(&id)),
            },
            guidance,
        })?;

        let mut context_files = vec![self.paths.roadmap(), plan_path];
        if progress_path.is_file() {
            context_files.push(progress_path);
        }
        let context_files = context_files
            .iter()
            .map(|path| PathBuf::from(display_path(root, path)))
            .collect();

        Ok(AgentRequest::new(
            root.to_path_buf(),
            prompt,
            &self.config.agent.model,
            EXECUTION_TOOLS,
            &self.config,
        )
        .with_context_files(context_files)
        .with_stream_log(stream_log))
    }

    /// Run the plan; the first failure or bailout sentinel stops the agent early.
    #[instrument(skip_all, fields(plan = %format!("{}-{}", plan.phase, plan.plan)))]
    pub fn run<A: Agent + ?Sized>(
        &self,
        agent: &A,
        plan: &Plan,
        guidance: Option<&str>,
        stream_log: PathBuf,
    ) -> Result<ParsedRun, InvokeError> {
        let request = self.request(plan, guidance, stream_log)?;
        run_parsed(agent, &request, self.config.output_tail_bytes, true, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedAgent, auto_task, plan, result_line};

    #[test]
    fn executor_runs_with_plan_prompt_and_context() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = LedgerPaths::new(temp.path());
        let executor = PlanExecutor::new(paths.clone(), EngineConfig::default());
        let record = plan(2, "01", vec![auto_task("1")]);
        let agent = ScriptedAgent::new(vec![vec![result_line("done ###PLAN_COMPLETE###")]]);

        let run = executor
            .run(&agent, &record, Some("finish the summary"), temp.path().join("stream.jsonl"))
            .expect("run");

        assert!(run.stream.completion.is_some());
        let requests = agent.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert!(request.prompt.contains("finish the summary"));
        assert!(request.prompt.contains(".planning/phases/02/02-01-summary.json"));
        assert_eq!(
            request.context_files,
            vec![
                PathBuf::from(".planning/roadmap.json"),
                PathBuf::from(".planning/phases/02/02-01-plan.json")
            ]
        );
        assert!(request.allowed_tools.iter().any(|tool| tool == "Edit"));
    }
}
