//! Plan ledger load/save with schema + invariant validation.
//!
//! Every load runs read → parse → schema → deserialize → invariants, and every
//! save runs the same checks before writing atomically. A record that fails
//! validation surfaces as [`LedgerError::Invalid`] with a field-addressable
//! report, which is what the self-heal loop consumes.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::invariants::{plan_invariants, roadmap_invariants, status_transition};
use crate::core::observation::{Observation, ObservationBody, open_blockers};
use crate::core::plan_number::PlanId;
use crate::core::records::{
    ObservationEntry, ObservationLog, Plan, ProgressRecord, ProjectState, Roadmap, Status, Summary,
};
use crate::core::schedule::PhasePlans;
use crate::core::validation::{
    FieldError, RecordKind, ValidationReport, parse_error, schema_errors,
};
use crate::io::atomic::write_atomic;
use crate::io::paths::LedgerPaths;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The record exists but violates its schema or invariants. Self-healable.
    #[error("{} is invalid: {report}", path.display())]
    Invalid {
        path: PathBuf,
        report: ValidationReport,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LedgerError {
    pub fn report(&self) -> Option<(&Path, &ValidationReport)> {
        match self {
            LedgerError::Invalid { path, report } => Some((path, report)),
            LedgerError::Other(_) => None,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// A strict-schema ledger record.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: RecordKind;

    /// Semantic checks the schema cannot express.
    fn invariants(&self) -> Vec<FieldError> {
        Vec::new()
    }
}

impl Record for Roadmap {
    const KIND: RecordKind = RecordKind::Roadmap;

    fn invariants(&self) -> Vec<FieldError> {
        roadmap_invariants(self)
    }
}

impl Record for ProjectState {
    const KIND: RecordKind = RecordKind::State;
}

impl Record for Plan {
    const KIND: RecordKind = RecordKind::Plan;

    fn invariants(&self) -> Vec<FieldError> {
        plan_invariants(self)
    }
}

impl Record for Summary {
    const KIND: RecordKind = RecordKind::Summary;
}

impl Record for ObservationLog {
    const KIND: RecordKind = RecordKind::Observations;
}

/// Validate raw JSON text as record `R`.
///
/// The outer error is reserved for opaque failures (schema compilation); every
/// problem with the text itself is reported in the inner `ValidationReport`.
pub fn decode<R: Record>(text: &str) -> anyhow::Result<Result<R, ValidationReport>> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            return Ok(Err(ValidationReport::new(
                R::KIND,
                vec![parse_error(&err.to_string())],
            )));
        }
    };
    let errors = schema_errors(R::KIND, &value)?;
    if !errors.is_empty() {
        return Ok(Err(ValidationReport::new(R::KIND, errors)));
    }
    let record: R = match serde_json::from_value(value) {
        Ok(record) => record,
        Err(err) => {
            return Ok(Err(ValidationReport::new(
                R::KIND,
                vec![parse_error(&err.to_string())],
            )));
        }
    };
    let errors = record.invariants();
    if !errors.is_empty() {
        return Ok(Err(ValidationReport::new(R::KIND, errors)));
    }
    Ok(Ok(record))
}

/// Validate an in-memory record exactly as a load would.
pub fn check<R: Record>(record: &R) -> anyhow::Result<Vec<FieldError>> {
    let value = serde_json::to_value(record).context("serialize record")?;
    let mut errors = schema_errors(R::KIND, &value)?;
    errors.extend(record.invariants());
    Ok(errors)
}

/// Load and validate a record from disk.
#[instrument(skip_all, fields(kind = %R::KIND, path = %path.display()))]
pub fn load<R: Record>(path: &Path) -> LedgerResult<R> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    match decode::<R>(&text)? {
        Ok(record) => Ok(record),
        Err(report) => {
            debug!(errors = report.errors.len(), "record failed validation");
            Err(LedgerError::Invalid {
                path: path.to_path_buf(),
                report,
            })
        }
    }
}

/// Validate, then atomically write a record. An invalid record leaves the target untouched.
#[instrument(skip_all, fields(kind = %R::KIND, path = %path.display()))]
pub fn save<R: Record>(path: &Path, record: &R) -> LedgerResult<()> {
    let errors = check(record)?;
    if !errors.is_empty() {
        warn!(errors = errors.len(), "refusing to save invalid record");
        return Err(LedgerError::Invalid {
            path: path.to_path_buf(),
            report: ValidationReport::new(R::KIND, errors),
        });
    }
    let mut buf = serde_json::to_string_pretty(record).context("serialize record")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())?;
    Ok(())
}

/// Validate the file at `path` as `kind`. `None` means valid.
pub fn validate_file(kind: RecordKind, path: &Path) -> anyhow::Result<Option<ValidationReport>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let report = match kind {
        RecordKind::Roadmap => decode::<Roadmap>(&text)?.err(),
        RecordKind::State => decode::<ProjectState>(&text)?.err(),
        RecordKind::Plan => decode::<Plan>(&text)?.err(),
        RecordKind::Summary => decode::<Summary>(&text)?.err(),
        RecordKind::Observations => decode::<ObservationLog>(&text)?.err(),
    };
    Ok(report)
}

/// Typed access to every record of one workspace.
#[derive(Debug, Clone)]
pub struct Ledger {
    paths: LedgerPaths,
}

impl Ledger {
    pub fn new(paths: LedgerPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &LedgerPaths {
        &self.paths
    }

    pub fn load_roadmap(&self) -> LedgerResult<Roadmap> {
        load(&self.paths.roadmap())
    }

    pub fn save_roadmap(&self, roadmap: &Roadmap) -> LedgerResult<()> {
        save(&self.paths.roadmap(), roadmap)
    }

    /// Project state; a missing file is a fresh state.
    pub fn load_state(&self) -> LedgerResult<ProjectState> {
        let path = self.paths.state();
        if !path.exists() {
            return Ok(ProjectState::default());
        }
        load(&path)
    }

    pub fn save_state(&self, state: &ProjectState) -> LedgerResult<()> {
        save(&self.paths.state(), state)
    }

    pub fn load_plan(&self, id: &PlanId) -> LedgerResult<Plan> {
        load(&self.paths.plan(id))
    }

    /// Save a plan, rejecting any status regression against the copy on disk.
    pub fn save_plan(&self, plan: &Plan) -> LedgerResult<()> {
        let id = plan
            .id()
            .ok_or_else(|| anyhow!("plan {}-{} has an invalid number", plan.phase, plan.plan))?;
        let path = self.paths.plan(&id);
        if let Some(previous) = self.previous_status(&path) {
            if let Some(error) = status_transition(previous, plan.status) {
                warn!(plan = %id, from = previous.as_str(), to = plan.status.as_str(), "status regression rejected");
                return Err(LedgerError::Invalid {
                    path,
                    report: ValidationReport::new(RecordKind::Plan, vec![error]),
                });
            }
        }
        save(&path, plan)
    }

    fn previous_status(&self, path: &Path) -> Option<Status> {
        let text = fs::read_to_string(path).ok()?;
        let value: Value = serde_json::from_str(&text).ok()?;
        serde_json::from_value(value.get("status")?.clone()).ok()
    }

    /// All plans listed for a phase in the roadmap.
    pub fn load_phase(&self, roadmap: &Roadmap, phase: u32) -> LedgerResult<PhasePlans> {
        let entry = roadmap
            .phase(phase)
            .ok_or_else(|| anyhow!("phase {phase} not in roadmap"))?;
        let mut plans = Vec::with_capacity(entry.plans.len());
        for raw in &entry.plans {
            let id = PlanId::parse(raw)
                .ok_or_else(|| anyhow!("roadmap lists malformed plan id {raw}"))?;
            plans.push(self.load_plan(&id)?);
        }
        Ok(PhasePlans::new(phase, plans))
    }

    pub fn load_all_phases(&self, roadmap: &Roadmap) -> LedgerResult<Vec<PhasePlans>> {
        roadmap
            .phases
            .iter()
            .map(|phase| self.load_phase(roadmap, phase.number))
            .collect()
    }

    /// True only for a summary that loads and passes its schema.
    pub fn has_valid_summary(&self, id: &PlanId) -> bool {
        if !self.paths.summary(id).is_file() {
            return false;
        }
        match self.load_summary(id) {
            Ok(_) => true,
            Err(LedgerError::Invalid { report, .. }) => {
                warn!(plan = %id, errors = report.errors.len(), "summary present but invalid");
                false
            }
            Err(LedgerError::Other(err)) => {
                warn!(plan = %id, err = %err, "summary unreadable");
                false
            }
        }
    }

    pub fn load_summary(&self, id: &PlanId) -> LedgerResult<Summary> {
        load(&self.paths.summary(id))
    }

    /// Raw progress text, compared byte-for-byte by stuck-loop detection.
    pub fn progress_text(&self, id: &PlanId) -> anyhow::Result<Option<String>> {
        let path = self.paths.progress(id);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    /// Progress record parsed tolerantly; unreadable content yields `None`.
    pub fn progress(&self, id: &PlanId) -> Option<ProgressRecord> {
        let text = self.progress_text(id).ok().flatten()?;
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!(plan = %id, err = %err, "progress record not parseable");
                None
            }
        }
    }

    /// Observation log for a phase; a missing file is an empty log.
    pub fn load_observations(&self, phase: u32) -> LedgerResult<ObservationLog> {
        let path = self.paths.observations(phase);
        if !path.exists() {
            return Ok(ObservationLog {
                phase,
                entries: Vec::new(),
            });
        }
        load(&path)
    }

    pub fn append_observations(
        &self,
        id: &PlanId,
        observations: Vec<Observation>,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        if observations.is_empty() {
            return Ok(());
        }
        let mut log = self.load_observations(id.phase)?;
        log.entries
            .extend(observations.into_iter().map(|observation| ObservationEntry {
                plan: id.to_string(),
                recorded_at: now,
                observation,
            }));
        save(&self.paths.observations(id.phase), &log)
    }

    pub fn open_blockers(&self, phase: u32) -> LedgerResult<Vec<ObservationBody>> {
        let log = self.load_observations(phase)?;
        Ok(open_blockers(log.entries.iter().map(|entry| &entry.observation))
            .into_iter()
            .cloned()
            .collect())
    }

    /// Every ledger file present on disk, paired with its record kind.
    pub fn record_files(&self) -> anyhow::Result<Vec<(RecordKind, PathBuf)>> {
        let mut files = vec![(RecordKind::Roadmap, self.paths.roadmap())];
        let state = self.paths.state();
        if state.exists() {
            files.push((RecordKind::State, state));
        }
        let phases_dir = self.paths.planning_dir().join("phases");
        if !phases_dir.exists() {
            return Ok(files);
        }
        let mut phase_dirs: Vec<PathBuf> = fs::read_dir(&phases_dir)
            .with_context(|| format!("read {}", phases_dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_dir())
            .collect();
        phase_dirs.sort();
        for dir in phase_dirs {
            let mut entries: Vec<PathBuf> = fs::read_dir(&dir)
                .with_context(|| format!("read {}", dir.display()))?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .collect();
            entries.sort();
            for path in entries {
                let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                    continue;
                };
                let kind = if name.ends_with("-plan.json") {
                    RecordKind::Plan
                } else if name.ends_with("-summary.json") {
                    RecordKind::Summary
                } else if name == "observations.json" {
                    RecordKind::Observations
                } else {
                    continue;
                };
                files.push((kind, path));
            }
        }
        Ok(files)
    }
}
