//! Project configuration.
//!
//! Loaded from `$HOME/.specwright/projects/<projectId>/config.yaml`.
//! Precedence: explicit file > per-project file > defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Hard ceiling for the fix-chunk iteration limit.
pub const MAX_ITERATIONS_CEILING: u32 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Executor backend settings (long-running backend, HTTP + SSE).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Base URL of the executor server.
    pub endpoint: String,
    pub model: String,
    /// Per-chunk execute timeout in seconds.
    pub timeout_sec: u64,
    pub max_tokens: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4096".to_string(),
            model: "claude-sonnet-4".to_string(),
            timeout_sec: 15 * 60,
            max_tokens: 32_000,
        }
    }
}

/// Planner backend settings (chunk generation; the core only spawns it).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlannerConfig {
    pub cli_path: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".to_string(),
        }
    }
}

/// Reviewer backend settings (short-lived backend, child process).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReviewerConfig {
    pub cli_path: String,
    pub model: String,
    /// Skip the reviewer entirely and record reviews as skipped.
    pub auto_approve: bool,
    /// Per-chunk review timeout in seconds.
    pub timeout_sec: u64,
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".to_string(),
            model: "claude-sonnet-4".to_string(),
            auto_approve: false,
            timeout_sec: 2 * 60,
        }
    }
}

/// Full per-project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub planner: PlannerConfig,
    pub reviewer: ReviewerConfig,

    /// Fix-lineage attempt limit before a chunk is escalated to failed.
    pub max_iterations: u32,
    /// Concurrent worker cap.
    pub max_concurrency: usize,

    // Git workflow
    pub base_branch: String,
    /// Prefer worktrees over in-place branch checkout.
    pub worktrees: bool,
    /// Worktrees older than this with an unmerged PR count as stale.
    pub stale_worktree_days: i64,

    // Sequencer policy
    /// Abort the whole spec on the first chunk failure.
    pub fail_fast: bool,
    /// Run the final reviewer over `base..HEAD` after the chunk loop.
    pub final_review: bool,
    /// Final review passes before it is forced to accept.
    pub final_review_passes: u32,

    // Validation policy
    /// When true, any zero-change chunk auto-fails. When false (lenient),
    /// only chunks whose description demands code changes do.
    pub strict_no_change: bool,
    /// Optional build command run during validation.
    pub build_command: Option<String>,
    /// Treat a failing build command as a stage failure.
    pub build_failure_fatal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            planner: PlannerConfig::default(),
            reviewer: ReviewerConfig::default(),
            max_iterations: 5,
            max_concurrency: 3,
            base_branch: "main".to_string(),
            worktrees: true,
            stale_worktree_days: 7,
            fail_fast: false,
            final_review: false,
            final_review_passes: 2,
            strict_no_change: false,
            build_command: None,
            build_failure_fatal: false,
        }
    }
}

impl Config {
    /// Load config from a YAML file, merging with defaults via serde.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the per-project config, falling back to defaults when absent.
    pub fn for_project(project_id: &str) -> Result<Self, ConfigError> {
        let path = Self::project_config_path(project_id);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Path of a project's config file: `~/.specwright/projects/<id>/config.yaml`.
    pub fn project_config_path(project_id: &str) -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".specwright")
            .join("projects")
            .join(project_id)
            .join("config.yaml")
    }

    /// Validate and clamp values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_iterations == 0 || self.max_iterations > MAX_ITERATIONS_CEILING {
            return Err(ConfigError::InvalidValue {
                key: "max_iterations".to_string(),
                reason: format!("must be between 1 and {MAX_ITERATIONS_CEILING}"),
            });
        }
        if self.final_review_passes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "final_review_passes".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.executor.endpoint.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "executor.endpoint".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
