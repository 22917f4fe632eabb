//! Engine configuration stored under `.planning/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields take defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduling iteration budget for one `run`.
    pub max_iterations: u32,

    /// Soft-failure cap per plan. Unset means `max_iterations`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries_per_plan: Option<u32>,

    /// Cumulative token count above which an attempt counts as a token-limit bailout.
    pub token_limit: u64,

    /// Wall-clock budget per agent invocation.
    pub attempt_timeout_secs: u64,

    /// Kill the agent if no output line arrives within this window.
    pub inactivity_timeout_secs: u64,

    /// Longest single stream record accepted before the stream is declared broken.
    pub max_line_bytes: usize,

    /// Size of the last-output snapshot kept per attempt.
    pub output_tail_bytes: usize,

    /// Repair attempts per invalid file. Unset means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_heal_max_attempts: Option<u32>,

    /// Run the post-execution analysis pass.
    pub analysis: bool,

    /// Run a plan's `validation` commands after a success.
    pub run_validation: bool,

    pub validation_timeout_secs: u64,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable.
    pub command: String,
    /// Extra arguments appended after the engine's own flags.
    pub args: Vec<String>,
    /// Model used for plan execution.
    pub model: String,
    /// Model used for blocker verification, recovery advice, repair and analysis.
    pub advisory_model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            model: "sonnet".to_string(),
            advisory_model: "sonnet".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_retries_per_plan: None,
            token_limit: 180_000,
            attempt_timeout_secs: 60 * 60,
            inactivity_timeout_secs: 10 * 60,
            max_line_bytes: 64 * 1024 * 1024,
            output_tail_bytes: 8 * 1024,
            self_heal_max_attempts: None,
            analysis: true,
            run_validation: true,
            validation_timeout_secs: 15 * 60,
            agent: AgentConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_retries_per_plan == Some(0) {
            return Err(anyhow!("max_retries_per_plan must be > 0 when set"));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(anyhow!("attempt_timeout_secs must be > 0"));
        }
        if self.inactivity_timeout_secs == 0 {
            return Err(anyhow!("inactivity_timeout_secs must be > 0"));
        }
        if self.max_line_bytes == 0 {
            return Err(anyhow!("max_line_bytes must be > 0"));
        }
        if self.output_tail_bytes == 0 {
            return Err(anyhow!("output_tail_bytes must be > 0"));
        }
        if self.validation_timeout_secs == 0 {
            return Err(anyhow!("validation_timeout_secs must be > 0"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must be non-empty"));
        }
        Ok(())
    }

    /// Effective soft-failure cap per plan.
    pub fn retry_cap(&self) -> u32 {
        self.max_retries_per_plan.unwrap_or(self.max_iterations)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.retry_cap(), 50);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = EngineConfig {
            max_retries_per_plan: Some(4),
            self_heal_max_attempts: Some(2),
            ..EngineConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.retry_cap(), 4);
    }

    /// Verifies partial files fill the rest from defaults.
    #[test]
    fn partial_file_uses_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 7\n[agent]\nmodel = \"opus\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 7);
        assert_eq!(cfg.agent.model, "opus");
        assert_eq!(cfg.agent.command, "claude");
        assert_eq!(cfg.token_limit, 180_000);
    }

    #[test]
    fn zero_iterations_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("max_iterations"));
    }
}
