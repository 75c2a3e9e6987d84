use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::SourceKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub directive: DirectiveConfig,
    #[serde(default)]
    pub producers: BTreeMap<String, CommandConfig>,
    #[serde(default)]
    pub research: Option<CommandConfig>,
    #[serde(default)]
    pub commit: Option<CommandConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// How approval requests raised before a commit are answered.
///
/// Resolved once when the controller is built; never re-read from the
/// environment during a run.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    AutoApprove,
    AutoReject,
    Interactive,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_max_parallel_scans")]
    pub max_parallel_scans: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_approval_mode")]
    pub approval_mode: ApprovalMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            max_parallel_scans: default_max_parallel_scans(),
            max_batch_size: default_max_batch_size(),
            chunk_size: default_chunk_size(),
            run_timeout_secs: default_run_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            approval_mode: default_approval_mode(),
        }
    }
}

impl PipelineConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn default_quality_threshold() -> f64 {
    0.85
}
fn default_max_parallel_scans() -> usize {
    4
}
fn default_max_batch_size() -> usize {
    100
}
fn default_chunk_size() -> usize {
    10
}
fn default_run_timeout_secs() -> u64 {
    1800
}
fn default_call_timeout_secs() -> u64 {
    300
}
fn default_approval_mode() -> ApprovalMode {
    ApprovalMode::AutoApprove
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            half_open_max_calls: default_half_open_max_calls(),
            success_threshold: default_success_threshold(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window_secs() -> u64 {
    60
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_half_open_max_calls() -> u32 {
    1
}
fn default_success_threshold() -> u32 {
    2
}

/// Source-selection directive handed to every discovery producer.
#[derive(Debug, Deserialize, Clone)]
pub struct DirectiveConfig {
    #[serde(default)]
    pub search_terms: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default = "default_days_back")]
    pub days_back: u32,
    /// Defaults to `max_parallel_scans * 25` when unset.
    #[serde(default)]
    pub max_discoveries: Option<usize>,
}

impl Default for DirectiveConfig {
    fn default() -> Self {
        Self {
            search_terms: Vec::new(),
            sources: Vec::new(),
            days_back: default_days_back(),
            max_discoveries: None,
        }
    }
}

fn default_days_back() -> u32 {
    7
}

/// An external collaborator implemented as a child process.
#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Source kind assumed for discoveries that do not declare one.
    #[serde(default)]
    pub source_kind: Option<SourceKind>,
}

impl Config {
    /// A config with only a database path; everything else defaulted.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            pipeline: PipelineConfig::default(),
            resilience: ResilienceConfig::default(),
            directive: DirectiveConfig::default(),
            producers: BTreeMap::new(),
            research: None,
            commit: None,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let p = &config.pipeline;
    if !(p.quality_threshold > 0.0 && p.quality_threshold <= 1.0) {
        anyhow::bail!("pipeline.quality_threshold must be in (0.0, 1.0]");
    }
    if p.max_parallel_scans == 0 {
        anyhow::bail!("pipeline.max_parallel_scans must be > 0");
    }
    if p.max_batch_size == 0 {
        anyhow::bail!("pipeline.max_batch_size must be > 0");
    }
    if p.chunk_size == 0 {
        anyhow::bail!("pipeline.chunk_size must be > 0");
    }
    if p.call_timeout_secs == 0 || p.run_timeout_secs == 0 {
        anyhow::bail!("pipeline timeouts must be > 0");
    }

    let r = &config.resilience;
    if r.max_attempts == 0 {
        anyhow::bail!("resilience.max_attempts must be >= 1");
    }
    if r.backoff_factor < 1.0 {
        anyhow::bail!("resilience.backoff_factor must be >= 1.0");
    }
    if r.failure_threshold == 0 || r.success_threshold == 0 || r.half_open_max_calls == 0 {
        anyhow::bail!(
            "resilience.failure_threshold, success_threshold and half_open_max_calls must be >= 1"
        );
    }

    let commands = config
        .producers
        .iter()
        .map(|(name, c)| (format!("producers.{}", name), c))
        .chain(config.research.iter().map(|c| ("research".to_string(), c)))
        .chain(config.commit.iter().map(|c| ("commit".to_string(), c)));
    for (section, cmd) in commands {
        if cmd.command.trim().is_empty() {
            anyhow::bail!("{}.command must not be empty", section);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let cfg: Config = toml::from_str("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(cfg.pipeline.quality_threshold, 0.85);
        assert_eq!(cfg.pipeline.chunk_size, 10);
        assert_eq!(cfg.pipeline.approval_mode, ApprovalMode::AutoApprove);
        assert_eq!(cfg.resilience.max_attempts, 3);
        assert_eq!(cfg.resilience.success_threshold, 2);
        assert!(cfg.producers.is_empty());
        validate(&cfg).unwrap();
    }

    #[test]
    fn test_named_producers_parse() {
        let cfg: Config = toml::from_str(
            r#"
[db]
path = "/tmp/x.sqlite"

[pipeline]
approval_mode = "auto_reject"

[producers.forums]
command = "python3"
args = ["scan_forums.py"]
source_kind = "forum"

[research]
command = "./research.sh"
"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.approval_mode, ApprovalMode::AutoReject);
        let forums = &cfg.producers["forums"];
        assert_eq!(forums.args, vec!["scan_forums.py".to_string()]);
        assert_eq!(forums.source_kind, Some(SourceKind::Community));
        assert!(cfg.research.is_some());
        assert!(cfg.commit.is_none());
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let mut cfg = Config::minimal("/tmp/x.sqlite");
        cfg.pipeline.quality_threshold = 0.0;
        assert!(validate(&cfg).is_err());
        cfg.pipeline.quality_threshold = 1.0;
        assert!(validate(&cfg).is_ok());
    }
}
