//! Iteration logging helpers for `.planning/iterations/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::stream::TokenUsage;
use crate::core::types::FailureClass;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub iter: u32,
    pub plan: String,
    /// Stable outcome label such as `success` or `soft:no_signal`.
    pub outcome: String,
    pub failure_class: FailureClass,
    /// Soft-failure attempts recorded for the plan after this iteration.
    pub attempts: u32,
    pub started_at: Option<String>,
    pub duration_ms: u64,
    pub usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    /// Raw tee of the execution stream.
    pub stream_path: PathBuf,
    /// Raw tee of the analysis stream.
    pub analysis_path: PathBuf,
    pub validation_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            meta_path: dir.join("meta.json"),
            stream_path: dir.join("stream.jsonl"),
            analysis_path: dir.join("analysis.jsonl"),
            validation_log_path: dir.join("validation.log"),
            dir,
        }
    }

    /// Stream tee for an advisory call such as `blocker` or `recovery`.
    pub fn advisory_stream(&self, kind: &str) -> PathBuf {
        self.dir.join(format!("{kind}.jsonl"))
    }
}

pub fn write_meta(paths: &IterationPaths, meta: &IterationMeta) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
    write_json(&paths.meta_path, meta)
}

/// Last stream tee left by an earlier iteration, if any.
pub fn latest_stream_log(iterations_dir: &Path, before_iter: u32) -> Option<PathBuf> {
    (1..before_iter)
        .rev()
        .map(|iter| iterations_dir.join(iter.to_string()).join("stream.jsonl"))
        .find(|path| path.is_file())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(temp.path().join(".planning/iterations/3"));

        assert!(paths.dir.ends_with(Path::new(".planning/iterations/3")));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.stream_path.ends_with("stream.jsonl"));
        assert!(paths.analysis_path.ends_with("analysis.jsonl"));
        assert!(paths.advisory_stream("blocker").ends_with("blocker.jsonl"));
    }

    #[test]
    fn writes_meta_and_finds_previous_stream() {
        let temp = tempfile::tempdir().expect("tempdir");
        let iterations = temp.path().join("iterations");
        let paths = IterationPaths::new(iterations.join("2"));
        let meta = IterationMeta {
            iter: 2,
            plan: "01-01".to_string(),
            outcome: "soft:no_signal".to_string(),
            failure_class: FailureClass::Soft,
            attempts: 1,
            started_at: None,
            duration_ms: 12,
            usage: TokenUsage::default(),
            error: None,
        };
        write_meta(&paths, &meta).expect("write");
        let written = fs::read_to_string(&paths.meta_path).expect("read");
        assert!(written.contains("\"failure_class\": \"soft\""));
        assert!(!written.contains("\"error\""));

        assert!(latest_stream_log(&iterations, 3).is_none());
        fs::write(&paths.stream_path, "{}\n").expect("stream");
        assert_eq!(latest_stream_log(&iterations, 3), Some(paths.stream_path.clone()));
        assert!(latest_stream_log(&iterations, 2).is_none());
    }
}
