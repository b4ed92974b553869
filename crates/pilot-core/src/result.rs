//! Final outcome of a pipeline run

use crate::run::PipelineRun;
use crate::stage::Stage;
use pilot_workspace::RollbackFailure;
use serde::Serialize;
use std::path::PathBuf;

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// All five stages passed
    Completed,
    /// A stage failed or the run was cancelled
    Failed { stage: Stage, reason: String },
    /// Planning tripped the approval gate
    ApprovalRequired { reason: String },
}

/// Everything a caller gets back from a run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub outcome: PipelineOutcome,
    pub run: PipelineRun,
    /// Workspace left on disk, if retained
    pub workspace: Option<PathBuf>,
    /// Undo entries that could not be replayed during the run
    pub rollback_failures: Vec<RollbackFailure>,
}

impl PipelineResult {
    /// Whether the run completed
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PipelineOutcome::Completed)
    }

    /// Failure or approval reason
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match &self.outcome {
            PipelineOutcome::Completed => None,
            PipelineOutcome::Failed { reason, .. } | PipelineOutcome::ApprovalRequired { reason } => {
                Some(reason)
            }
        }
    }

    /// One-line human outcome
    #[must_use]
    pub fn summary(&self) -> String {
        let id = self.run.id();
        match &self.outcome {
            PipelineOutcome::Completed => {
                let files = self.run.touched_files().len();
                let revisions = self.run.revision_count();
                format!("run {id} completed: {files} file(s) changed after {revisions} revision(s)")
            }
            PipelineOutcome::Failed { stage, reason } => {
                format!("run {id} failed during {stage}: {reason}")
            }
            PipelineOutcome::ApprovalRequired { reason } => {
                format!("run {id} awaiting approval: {}", reason.replace('\n', "; "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: PipelineOutcome) -> PipelineResult {
        PipelineResult {
            outcome,
            run: PipelineRun::new("r"),
            workspace: None,
            rollback_failures: Vec::new(),
        }
    }

    #[test]
    fn summaries() {
        let done = result(PipelineOutcome::Completed);
        assert!(done.is_success());
        assert!(done.summary().ends_with("completed: 0 file(s) changed after 0 revision(s)"));

        let failed = result(PipelineOutcome::Failed {
            stage: Stage::Reviewing,
            reason: "maximum revisions exceeded".to_string(),
        });
        assert!(failed.summary().contains("failed during reviewing: maximum revisions exceeded"));

        let waiting = result(PipelineOutcome::ApprovalRequired {
            reason: "a\nb".to_string(),
        });
        assert!(waiting.summary().ends_with("awaiting approval: a; b"));
        assert_eq!(waiting.reason(), Some("a\nb"));
    }

    #[test]
    fn outcome_serializes_tagged() {
        let json = serde_json::to_value(PipelineOutcome::ApprovalRequired {
            reason: "x".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "approval_required");
    }
}
