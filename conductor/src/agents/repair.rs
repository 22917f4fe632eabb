//! Repair agent: edits one invalid ledger file toward its schema.

use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::core::validation::ValidationReport;
use crate::io::agent::{Agent, AgentRequest, REPAIR_TOOLS, run_parsed};
use crate::io::config::EngineConfig;
use crate::io::paths::LedgerPaths;
use crate::io::process::InvokeError;
use crate::io::prompt::render_repair;

use super::display_path;

#[derive(Debug, Clone)]
pub struct RepairAgent {
    paths: LedgerPaths,
    config: EngineConfig,
}

impl RepairAgent {
    pub fn new(paths: LedgerPaths, config: EngineConfig) -> Self {
        Self { paths, config }
    }

    pub fn request(
        &self,
        file: &Path,
        report: &ValidationReport,
        stream_log: Option<PathBuf>,
    ) -> Result<AgentRequest, InvokeError> {
        let root = self.paths.root();
        let shown = display_path(root, file);
        let prompt = render_repair(&shown, report)?;
        let request = AgentRequest::new(
            root.to_path_buf(),
            prompt,
            &self.config.agent.advisory_model,
            REPAIR_TOOLS,
            &self.config,
        )
        .with_context_files(vec![PathBuf::from(shown)]);
        Ok(match stream_log {
            Some(path) => request.with_stream_log(path),
            None => request,
        })
    }

    /// One repair attempt. The caller re-validates the file afterwards.
    #[instrument(skip_all, fields(file = %file.display(), errors = report.errors.len()))]
    pub fn run<A: Agent + ?Sized>(
        &self,
        agent: &A,
        file: &Path,
        report: &ValidationReport,
        stream_log: Option<PathBuf>,
    ) -> Result<(), InvokeError> {
        let request = self.request(file, report, stream_log)?;
        run_parsed(agent, &request, self.config.output_tail_bytes, false, false)?;
        Ok(())
    }
}
