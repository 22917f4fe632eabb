//! Self-heal loop: repair an invalid ledger file until it validates.

use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::agents::repair::RepairAgent;
use crate::core::validation::ValidationReport;
use crate::error::EngineError;
use crate::io::agent::Agent;
use crate::io::ledger::{LedgerError, LedgerResult, validate_file};

/// Repair attempts spent on one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealOutcome {
    pub attempts: u32,
}

/// Run repair → re-validate until the file passes or `cap` attempts are spent.
///
/// `cap = None` means unbounded; callers inside the scheduling loop pass the
/// iteration budget so the loop stays bounded overall.
#[instrument(skip_all, fields(file = %path.display(), kind = %report.kind))]
pub fn heal_file<A: Agent + ?Sized>(
    agent: &A,
    repairer: &RepairAgent,
    path: &Path,
    report: ValidationReport,
    cap: Option<u32>,
    stream_dir: Option<&Path>,
) -> Result<HealOutcome, EngineError> {
    let kind = report.kind;
    let mut report = report;
    let mut attempts = 0u32;
    loop {
        if cap.is_some_and(|cap| attempts >= cap) {
            warn!(attempts, errors = report.errors.len(), "self-heal cap reached");
            return Err(EngineError::HealExhausted {
                path: path.to_path_buf(),
                attempts,
            });
        }
        attempts += 1;
        let stream_log = stream_dir.map(|dir| dir.join(format!("repair-{attempts}.jsonl")));
        if let Err(err) = repairer.run(agent, path, &report, stream_log) {
            warn!(attempt = attempts, err = %err, "repair attempt failed to run");
        }
        match validate_file(kind, path)? {
            None => {
                info!(attempts, "record repaired");
                return Ok(HealOutcome { attempts });
            }
            Some(next) => {
                info!(attempt = attempts, errors = next.errors.len(), "record still invalid");
                report = next;
            }
        }
    }
}

/// Load through `load`, healing the offending file whenever it reports invalid.
///
/// Opaque failures propagate untouched; only [`LedgerError::Invalid`] is repaired.
pub fn load_healed<T, A: Agent + ?Sized>(
    agent: &A,
    repairer: &RepairAgent,
    cap: Option<u32>,
    stream_dir: Option<&Path>,
    mut load: impl FnMut() -> LedgerResult<T>,
) -> Result<T, EngineError> {
    let mut healed: Vec<PathBuf> = Vec::new();
    loop {
        match load() {
            Ok(value) => return Ok(value),
            Err(LedgerError::Invalid { path, report }) => {
                // Repaired file passes validation yet the loader still rejects it.
                if healed.contains(&path) && validate_file(report.kind, &path)?.is_none() {
                    return Err(LedgerError::Invalid { path, report }.into());
                }
                heal_file(agent, repairer, &path, report, cap, stream_dir)?;
                healed.push(path);
            }
            Err(err) => return Err(err.into()),
        }
    }
}
