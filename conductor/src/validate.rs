//! Ledger-wide validation and repair for `conductor validate`.

use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use crate::core::validation::{RecordKind, ValidationReport};
use crate::error::EngineError;
use crate::execute::Engine;
use crate::heal::heal_file;
use crate::io::agent::Agent;
use crate::io::guards::GateRunner;
use crate::io::ledger::{Ledger, validate_file};

/// One ledger file that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRecord {
    pub kind: RecordKind,
    pub path: PathBuf,
    pub report: ValidationReport,
}

/// A file the heal loop brought back to valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealedRecord {
    pub path: PathBuf,
    pub attempts: u32,
}

/// Validate every ledger record on disk; returns the invalid ones.
pub fn validate_ledger(ledger: &Ledger) -> Result<Vec<InvalidRecord>> {
    let mut invalid = Vec::new();
    for (kind, path) in ledger.record_files()? {
        if let Some(report) = validate_file(kind, &path)? {
            invalid.push(InvalidRecord { kind, path, report });
        }
    }
    Ok(invalid)
}

/// Validate every record and run the self-heal loop on each invalid one.
pub fn heal_ledger<A, G>(engine: &Engine<'_, A, G>) -> Result<Vec<HealedRecord>, EngineError>
where
    A: Agent + ?Sized,
    G: GateRunner + ?Sized,
{
    let mut healed = Vec::new();
    for record in validate_ledger(engine.ledger())? {
        let outcome = heal_file(
            engine.agent(),
            engine.repairer(),
            &record.path,
            record.report,
            Some(engine.heal_cap()),
            None,
        )?;
        info!(path = %record.path.display(), attempts = outcome.attempts, "record healed");
        healed.push(HealedRecord {
            path: record.path,
            attempts: outcome.attempts,
        });
    }
    Ok(healed)
}
