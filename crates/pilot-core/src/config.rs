//! Pipeline configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! max_revision_iterations = 2
//! min_evaluation_score = 7.0
//!
//! [approval]
//! max_step_loc = 300
//!
//! [workspace]
//! base_dir = "/tmp/pilot"
//! retention = "remove"
//! ```

use crate::error::PipelineError;
use crate::telemetry::TelemetryConfig;
use pilot_workspace::{PopulateOptions, Retention};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Approval gate thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    /// Largest estimated line count a single step may declare
    pub max_step_loc: u32,
    /// Largest number of plan steps
    pub max_steps: usize,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            max_step_loc: 300,
            max_steps: 7,
        }
    }
}

/// Where and how run workspaces are created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Parent directory of per-run workspaces
    pub base_dir: PathBuf,
    /// Keep or remove the workspace when the run ends
    pub retention: Retention,
    /// Entry names not copied from the project
    pub exclude: Vec<String>,
    /// Files larger than this are not copied
    pub max_file_bytes: Option<u64>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        let populate = PopulateOptions::default();
        Self {
            base_dir: std::env::temp_dir().join("pilot-workspaces"),
            retention: Retention::Keep,
            exclude: populate.exclude,
            max_file_bytes: populate.max_file_bytes,
        }
    }
}

impl WorkspaceConfig {
    /// Populate filter for this configuration
    #[must_use]
    pub fn populate_options(&self) -> PopulateOptions {
        PopulateOptions::default()
            .with_exclude(self.exclude.iter().cloned())
            .with_max_file_bytes(self.max_file_bytes)
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Revision cycles allowed after the initial review
    pub max_revision_iterations: u32,
    /// Lowest passing evaluation score (0-10)
    pub min_evaluation_score: f64,
    /// Per agent call; 0 disables the timeout
    pub agent_timeout_secs: u64,
    /// Approval gate thresholds
    pub approval: ApprovalPolicy,
    /// Workspace settings
    pub workspace: WorkspaceConfig,
    /// Logging settings
    pub telemetry: TelemetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_revision_iterations: 2,
            min_evaluation_score: 7.0,
            agent_timeout_secs: 600,
            approval: ApprovalPolicy::default(),
            workspace: WorkspaceConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TOML and validate
    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        let config: Self =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject values the controller cannot work with
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.min_evaluation_score.is_finite() || self.min_evaluation_score < 0.0 {
            return Err(PipelineError::Config(format!(
                "min_evaluation_score must be a non-negative number, got {}",
                self.min_evaluation_score
            )));
        }
        if self.approval.max_steps == 0 {
            return Err(PipelineError::Config(
                "approval.max_steps must be at least 1".to_string(),
            ));
        }
        if self.workspace.base_dir.as_os_str().is_empty() {
            return Err(PipelineError::Config(
                "workspace.base_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Agent call timeout, if enabled
    #[must_use]
    pub fn agent_timeout(&self) -> Option<Duration> {
        (self.agent_timeout_secs > 0).then(|| Duration::from_secs(self.agent_timeout_secs))
    }

    /// With revision cap
    #[inline]
    #[must_use]
    pub fn with_max_revision_iterations(mut self, max: u32) -> Self {
        self.max_revision_iterations = max;
        self
    }

    /// With evaluation threshold
    #[inline]
    #[must_use]
    pub fn with_min_evaluation_score(mut self, score: f64) -> Self {
        self.min_evaluation_score = score;
        self
    }

    /// With agent timeout in seconds
    #[inline]
    #[must_use]
    pub fn with_agent_timeout_secs(mut self, secs: u64) -> Self {
        self.agent_timeout_secs = secs;
        self
    }

    /// With approval thresholds
    #[inline]
    #[must_use]
    pub fn with_approval(mut self, approval: ApprovalPolicy) -> Self {
        self.approval = approval;
        self
    }

    /// With workspace parent directory
    #[inline]
    #[must_use]
    pub fn with_workspace_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.workspace.base_dir = base_dir.into();
        self
    }

    /// With workspace retention
    #[inline]
    #[must_use]
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.workspace.retention = retention;
        self
    }
}
