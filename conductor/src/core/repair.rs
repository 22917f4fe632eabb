//! Machine-readable error block embedded in self-heal repair prompts.
//!
//! The repair agent sees both a readable list and a fenced JSON block with the
//! exact `FieldError` values, so nothing about path, expected shape or actual
//! value is lost in rendering.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::validation::{FieldError, ValidationReport};

const FENCE_INFO: &str = "json field-errors";

static ERROR_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json field-errors\n(.*?)\n```").expect("error block regex is valid")
});

/// One readable line per error: path, expected, actual and fix.
pub fn render_error_list(report: &ValidationReport) -> String {
    report
        .errors
        .iter()
        .map(|error| format!("- {error}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fenced JSON block holding the report's errors.
pub fn render_error_block(report: &ValidationReport) -> String {
    let body = serde_json::to_string_pretty(&report.errors).unwrap_or_else(|_| "[]".to_string());
    format!("```{FENCE_INFO}\n{body}\n```")
}

/// Recover the errors from text containing a rendered error block.
pub fn parse_error_block(text: &str) -> Option<Vec<FieldError>> {
    let captures = ERROR_BLOCK_RE.captures(text)?;
    serde_json::from_str(captures.get(1)?.as_str()).ok()
}
