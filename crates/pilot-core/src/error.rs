//! Error types for the pipeline
//!
//! Every variant is fatal to the run and is converted by the controller into
//! a `Failed` outcome. Awaiting approval is not an error; see
//! [`PipelineOutcome`](crate::result::PipelineOutcome).

use crate::stage::Stage;
use pilot_workspace::WorkspaceError;

/// Pipeline error
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Agent reported failure or timed out; message surfaced verbatim
    #[error("{stage} agent failed: {message}")]
    AgentFailure { stage: Stage, message: String },

    /// Required structured fields missing or malformed
    #[error("{stage} output invalid: {message}")]
    ValidationFailure {
        stage: Stage,
        missing: Vec<String>,
        message: String,
    },

    /// Patch could not be parsed or applied; already rolled back
    #[error("patch application failed: {0}")]
    PatchApplication(String),

    /// Review still asked for revision after the last allowed iteration
    #[error("maximum revisions exceeded ({iterations} revisions, review still requests changes)")]
    RevisionExhausted { iterations: u32 },

    /// Review rejected the change outright
    #[error("review rejected the change: {summary}")]
    ReviewRejected { summary: String },

    /// Evaluation verdict or score failed the run
    #[error("evaluation rejected: {reason}")]
    EvaluationRejected { score: f64, reason: String },

    /// Cancellation was requested
    #[error("pipeline cancelled during {stage}")]
    Cancelled { stage: Stage },

    /// Workspace could not be created or populated
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    /// Invalid configuration or agent registry
    #[error("configuration error: {0}")]
    Config(String),

    /// Illegal stage transition
    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    /// Stage output snapshot was already set
    #[error("{stage} output already recorded")]
    OutputAlreadyRecorded { stage: Stage },

    /// Stage has no output snapshot
    #[error("{stage} has no output slot")]
    NoOutputSlot { stage: Stage },
}

impl PipelineError {
    /// Create validation error listing missing fields
    pub fn missing_fields(stage: Stage, missing: Vec<String>) -> Self {
        let message = format!("missing required fields: {}", missing.join(", "));
        Self::ValidationFailure {
            stage,
            missing,
            message,
        }
    }

    /// Create validation error for a malformed payload
    pub fn malformed(stage: Stage, message: impl Into<String>) -> Self {
        Self::ValidationFailure {
            stage,
            missing: Vec::new(),
            message: message.into(),
        }
    }

    /// Check if error came from cancellation
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_names_every_field() {
        let err = PipelineError::missing_fields(
            Stage::Planning,
            vec!["risk".to_string(), "verify".to_string()],
        );
        assert_eq!(
            err.to_string(),
            "planning output invalid: missing required fields: risk, verify"
        );
    }

    #[test]
    fn revision_exhausted_message() {
        let err = PipelineError::RevisionExhausted { iterations: 2 };
        assert!(err.to_string().contains("maximum revisions exceeded"));
    }

    #[test]
    fn cancelled_is_distinguished() {
        let err = PipelineError::Cancelled {
            stage: Stage::Coding,
        };
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "pipeline cancelled during coding");
    }
}
