//! Strict schema validation for ledger records.
//!
//! Every persisted record kind has an embedded JSON Schema (Draft 2020-12,
//! `additionalProperties: false`). Violations are reported as [`FieldError`]s with
//! a dotted path, the expected shape, the actual value and a one-line fix, so the
//! same report can be shown to a human or handed to a repair agent.

use std::fmt;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use jsonschema::Validator;
use jsonschema::error::ValidationErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ROADMAP_SCHEMA: &str = include_str!("../../schemas/roadmap.schema.json");
const STATE_SCHEMA: &str = include_str!("../../schemas/state.schema.json");
const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");
const SUMMARY_SCHEMA: &str = include_str!("../../schemas/summary.schema.json");
const OBSERVATIONS_SCHEMA: &str = include_str!("../../schemas/observations.schema.json");

/// Longest rendering of an offending value kept in a [`FieldError`].
const ACTUAL_PREVIEW_CHARS: usize = 160;

/// Record kinds that carry a strict schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Roadmap,
    State,
    Plan,
    Summary,
    Observations,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Roadmap,
        RecordKind::State,
        RecordKind::Plan,
        RecordKind::Summary,
        RecordKind::Observations,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RecordKind::Roadmap => "roadmap",
            RecordKind::State => "state",
            RecordKind::Plan => "plan",
            RecordKind::Summary => "summary",
            RecordKind::Observations => "observations",
        }
    }

    /// Raw schema text, embedded for repair prompts.
    pub fn schema_source(self) -> &'static str {
        match self {
            RecordKind::Roadmap => ROADMAP_SCHEMA,
            RecordKind::State => STATE_SCHEMA,
            RecordKind::Plan => PLAN_SCHEMA,
            RecordKind::Summary => SUMMARY_SCHEMA,
            RecordKind::Observations => OBSERVATIONS_SCHEMA,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One field-addressable violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path from the record root, e.g. `.tasks[0].verify`. The root is `.`.
    pub path: String,
    pub expected: String,
    pub actual: String,
    /// One-line instruction that makes the field valid.
    pub fix: String,
}

impl FieldError {
    pub fn new(
        path: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
        fix: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
            fix: fix.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, got {} (fix: {})",
            self.path, self.expected, self.actual, self.fix
        )
    }
}

/// All violations found in one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub kind: RecordKind,
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    pub fn new(kind: RecordKind, errors: Vec<FieldError>) -> Self {
        Self { kind, errors }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// True if any error sits at `path` or below it.
    pub fn touches(&self, path: &str) -> bool {
        self.errors.iter().any(|err| err.path.starts_with(path))
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} record has {} error(s)", self.kind, self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n- {err}")?;
        }
        Ok(())
    }
}

struct SchemaSet {
    roadmap: Validator,
    state: Validator,
    plan: Validator,
    summary: Validator,
    observations: Validator,
}

impl SchemaSet {
    fn compile() -> Result<Self, String> {
        Ok(Self {
            roadmap: compile(RecordKind::Roadmap)?,
            state: compile(RecordKind::State)?,
            plan: compile(RecordKind::Plan)?,
            summary: compile(RecordKind::Summary)?,
            observations: compile(RecordKind::Observations)?,
        })
    }

    fn get(&self, kind: RecordKind) -> &Validator {
        match kind {
            RecordKind::Roadmap => &self.roadmap,
            RecordKind::State => &self.state,
            RecordKind::Plan => &self.plan,
            RecordKind::Summary => &self.summary,
            RecordKind::Observations => &self.observations,
        }
    }
}

fn compile(kind: RecordKind) -> Result<Validator, String> {
    let schema: Value = serde_json::from_str(kind.schema_source())
        .map_err(|err| format!("parse {kind} schema: {err}"))?;
    jsonschema::validator_for(&schema).map_err(|err| format!("compile {kind} schema: {err}"))
}

static SCHEMAS: LazyLock<Result<SchemaSet, String>> = LazyLock::new(SchemaSet::compile);

/// Validate `value` against the schema for `kind`.
///
/// Fails only if the embedded schemas themselves do not compile.
pub fn schema_errors(kind: RecordKind, value: &Value) -> Result<Vec<FieldError>> {
    let schemas = SCHEMAS
        .as_ref()
        .map_err(|err| anyhow!("embedded schemas are invalid: {err}"))?;
    Ok(schemas
        .get(kind)
        .iter_errors(value)
        .map(|err| {
            let base = pointer_to_path(err.instance_path().as_str());
            describe(err.kind(), &base, err.instance(), &err.to_string())
        })
        .collect())
}

/// Report for text that is not JSON at all.
pub fn parse_error(message: &str) -> FieldError {
    FieldError::new(
        ".",
        "a single JSON object",
        preview(message),
        "rewrite the file as valid JSON matching the schema",
    )
}

/// Convert a JSON pointer (`/tasks/0/verify`) to a dotted path (`.tasks[0].verify`).
pub fn pointer_to_path(pointer: &str) -> String {
    if pointer.is_empty() || pointer == "/" {
        return ".".to_string();
    }
    let mut path = String::new();
    for segment in pointer.trim_start_matches('/').split('/') {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            path.push_str(&format!("[{segment}]"));
        } else {
            path.push('.');
            path.push_str(&segment);
        }
    }
    path
}

/// Append a property name to a dotted path.
pub fn child_path(base: &str, property: &str) -> String {
    if base == "." {
        format!(".{property}")
    } else {
        format!("{base}.{property}")
    }
}

fn describe(kind: &ValidationErrorKind, base: &str, instance: &Value, message: &str) -> FieldError {
    match kind {
        ValidationErrorKind::Required { property } => {
            let name = property
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| property.to_string());
            FieldError::new(
                child_path(base, &name),
                "required field",
                "missing",
                format!("add the `{name}` field"),
            )
        }
        ValidationErrorKind::AdditionalProperties { unexpected } => FieldError::new(
            base,
            "no unrecognized fields",
            unexpected.join(", "),
            format!("remove unrecognized field(s): {}", unexpected.join(", ")),
        ),
        ValidationErrorKind::Enum { options } => FieldError::new(
            base,
            format!("one of {options}"),
            preview(&instance.to_string()),
            format!("replace with one of {options}"),
        ),
        ValidationErrorKind::Type { .. } => {
            let expected = message
                .split_once(" is not of type ")
                .map(|(_, ty)| format!("type {ty}"))
                .unwrap_or_else(|| "a different type".to_string());
            FieldError::new(
                base,
                expected.clone(),
                preview(&instance.to_string()),
                format!("change the value to {expected}"),
            )
        }
        ValidationErrorKind::MinItems { limit } => FieldError::new(
            base,
            format!("at least {limit} item(s)"),
            preview(&instance.to_string()),
            format!("add at least {limit} item(s)"),
        ),
        ValidationErrorKind::MinLength { limit } => FieldError::new(
            base,
            format!("at least {limit} character(s)"),
            preview(&instance.to_string()),
            "provide a non-empty value",
        ),
        ValidationErrorKind::Minimum { limit } => FieldError::new(
            base,
            format!("a number >= {limit}"),
            preview(&instance.to_string()),
            format!("use a value of at least {limit}"),
        ),
        ValidationErrorKind::Pattern { pattern } => FieldError::new(
            base,
            format!("a string matching {pattern}"),
            preview(&instance.to_string()),
            "reformat the value to match the pattern",
        ),
        _ => FieldError::new(
            base,
            "a value accepted by the schema",
            preview(&instance.to_string()),
            preview(message),
        ),
    }
}

fn preview(raw: &str) -> String {
    if raw.chars().count() <= ACTUAL_PREVIEW_CHARS {
        return raw.to_string();
    }
    let cut: String = raw.chars().take(ACTUAL_PREVIEW_CHARS).collect();
    format!("{cut}…")
}
