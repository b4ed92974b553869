//! The unit of work for one change request
//!
//! [`PipelineRun`] is owned by the controller and mutated only through its
//! named operations, each of which checks the run's invariants:
//! - stage changes follow [`allowed_transitions`](crate::stage::allowed_transitions)
//! - stage output snapshots are set at most once
//! - the history gets one entry per [`advance_stage`](PipelineRun::advance_stage)
//! - at most one terminal state is reached

use crate::error::PipelineError;
use crate::payload::ReviewVerdict;
use crate::stage::{validate_transition, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use ulid::Ulid;

/// Unique run identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTransition {
    pub stage: Stage,
    pub previous: Stage,
    pub at: DateTime<Utc>,
}

/// Raw output of each working stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageOutputs {
    pub plan: Option<String>,
    /// Initial coding output; revisions are in [`PipelineRun::revisions`]
    pub patch: Option<String>,
    /// Final review
    pub review: Option<String>,
    pub test_report: Option<String>,
    pub evaluation: Option<String>,
}

impl StageOutputs {
    fn slot(&mut self, stage: Stage) -> Option<&mut Option<String>> {
        match stage {
            Stage::Planning => Some(&mut self.plan),
            Stage::Coding => Some(&mut self.patch),
            Stage::Reviewing => Some(&mut self.review),
            Stage::Testing => Some(&mut self.test_report),
            Stage::Evaluating => Some(&mut self.evaluation),
            _ => None,
        }
    }
}

/// One revision-loop cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionRecord {
    /// 1-based cycle number
    pub iteration: u32,
    /// Coding output of this cycle
    pub patch: String,
    /// Review of that patch
    pub review: String,
    pub verdict: ReviewVerdict,
}

/// State of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    id: RunId,
    request: String,
    stage: Stage,
    outputs: StageOutputs,
    workspace_root: Option<PathBuf>,
    touched_files: Vec<PathBuf>,
    approval_required: bool,
    approval_reason: Option<String>,
    failure: Option<String>,
    failed_during: Option<Stage>,
    history: Vec<StageTransition>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    revision_count: u32,
    revisions: Vec<RevisionRecord>,
}

impl PipelineRun {
    /// Create run for `request` in `NotStarted`
    #[must_use]
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            request: request.into(),
            stage: Stage::NotStarted,
            outputs: StageOutputs::default(),
            workspace_root: None,
            touched_files: Vec::new(),
            approval_required: false,
            approval_reason: None,
            failure: None,
            failed_during: None,
            history: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            revision_count: 0,
            revisions: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Enter the next working stage and append a history entry
    ///
    /// Terminal stages are reached through [`fail`](Self::fail),
    /// [`complete`](Self::complete) and
    /// [`request_approval`](Self::request_approval) instead.
    pub fn advance_stage(&mut self, to: Stage) -> Result<(), PipelineError> {
        if !to.is_working() {
            return Err(PipelineError::InvalidTransition {
                from: self.stage,
                to,
            });
        }
        validate_transition(self.stage, to)?;
        tracing::info!(run_id = %self.id, from = %self.stage, stage = %to, "stage entered");
        self.history.push(StageTransition {
            stage: to,
            previous: self.stage,
            at: Utc::now(),
        });
        self.stage = to;
        Ok(())
    }

    /// Set a working stage's output snapshot; once only
    pub fn record_output(
        &mut self,
        stage: Stage,
        output: impl Into<String>,
    ) -> Result<(), PipelineError> {
        let slot = self
            .outputs
            .slot(stage)
            .ok_or(PipelineError::NoOutputSlot { stage })?;
        if slot.is_some() {
            return Err(PipelineError::OutputAlreadyRecorded { stage });
        }
        *slot = Some(output.into());
        Ok(())
    }

    /// Stop at `AwaitingApproval`; only legal from `Planning`
    pub fn request_approval(&mut self, reason: impl Into<String>) -> Result<(), PipelineError> {
        validate_transition(self.stage, Stage::AwaitingApproval)?;
        self.stage = Stage::AwaitingApproval;
        self.approval_required = true;
        self.approval_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Replace the list of files whose changes are on disk
    pub fn set_applied_files(&mut self, files: Vec<PathBuf>) {
        self.touched_files = files;
    }

    /// Start a revision cycle, returning its 1-based number
    ///
    /// Fails with [`PipelineError::RevisionExhausted`] once `max` cycles ran.
    pub fn begin_revision(&mut self, max: u32) -> Result<u32, PipelineError> {
        if self.revision_count >= max {
            return Err(PipelineError::RevisionExhausted {
                iterations: self.revision_count,
            });
        }
        self.revision_count += 1;
        Ok(self.revision_count)
    }

    /// Append the record of the current revision cycle
    pub fn record_revision(&mut self, record: RevisionRecord) {
        self.revisions.push(record);
    }

    /// End the run as `Failed`
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), PipelineError> {
        validate_transition(self.stage, Stage::Failed)?;
        self.failed_during = Some(self.stage);
        self.stage = Stage::Failed;
        self.failure = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// End the run as `Completed`; only legal from `Evaluating`
    pub fn complete(&mut self) -> Result<(), PipelineError> {
        validate_transition(self.stage, Stage::Completed)?;
        self.stage = Stage::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Record where the run's workspace lives
    pub fn attach_workspace(&mut self, root: impl Into<PathBuf>) {
        self.workspace_root = Some(root.into());
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    #[must_use]
    pub fn id(&self) -> RunId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn request(&self) -> &str {
        &self.request
    }

    #[inline]
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[inline]
    #[must_use]
    pub fn outputs(&self) -> &StageOutputs {
        &self.outputs
    }

    #[inline]
    #[must_use]
    pub fn workspace_root(&self) -> Option<&Path> {
        self.workspace_root.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn touched_files(&self) -> &[PathBuf] {
        &self.touched_files
    }

    #[inline]
    #[must_use]
    pub fn approval_required(&self) -> bool {
        self.approval_required
    }

    #[inline]
    #[must_use]
    pub fn approval_reason(&self) -> Option<&str> {
        self.approval_reason.as_deref()
    }

    /// Failure message, when `Failed`
    #[inline]
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Stage the run was in when it failed
    #[inline]
    #[must_use]
    pub fn failed_during(&self) -> Option<Stage> {
        self.failed_during
    }

    #[inline]
    #[must_use]
    pub fn history(&self) -> &[StageTransition] {
        &self.history
    }

    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[inline]
    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[inline]
    #[must_use]
    pub fn revision_count(&self) -> u32 {
        self.revision_count
    }

    #[inline]
    #[must_use]
    pub fn revisions(&self) -> &[RevisionRecord] {
        &self.revisions
    }

    /// Latest applied coding output
    #[must_use]
    pub fn effective_patch(&self) -> Option<&str> {
        self.revisions
            .last()
            .map(|r| r.patch.as_str())
            .or(self.outputs.patch.as_deref())
    }

    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn success_path_records_one_entry_per_transition() {
        let mut run = PipelineRun::new("add a flag");
        for stage in Stage::WORKING {
            run.advance_stage(stage).unwrap();
        }
        run.complete().unwrap();

        assert_eq!(run.history().len(), 5);
        assert_eq!(run.history()[0].previous, Stage::NotStarted);
        assert_eq!(run.history()[4].stage, Stage::Evaluating);
        assert_eq!(run.stage(), Stage::Completed);
        assert!(run.completed_at().is_some());
    }

    #[test]
    fn approval_from_planning_keeps_single_history_entry() {
        let mut run = PipelineRun::new("r");
        run.advance_stage(Stage::Planning).unwrap();
        run.request_approval("risk level is high").unwrap();

        assert_eq!(run.history().len(), 1);
        assert_eq!(run.stage(), Stage::AwaitingApproval);
        assert!(run.approval_required());
        assert_eq!(run.approval_reason(), Some("risk level is high"));
    }

    #[test]
    fn illegal_moves_are_rejected() {
        let mut run = PipelineRun::new("r");
        assert!(run.advance_stage(Stage::Coding).is_err());
        assert!(run.advance_stage(Stage::Completed).is_err());
        assert!(run.complete().is_err());

        run.advance_stage(Stage::Planning).unwrap();
        run.advance_stage(Stage::Coding).unwrap();
        assert!(run.request_approval("late").is_err());
        assert_eq!(run.history().len(), 2);
    }

    #[test]
    fn single_terminal_state() {
        let mut run = PipelineRun::new("r");
        run.advance_stage(Stage::Planning).unwrap();
        run.fail("agent failed").unwrap();

        assert_eq!(run.failed_during(), Some(Stage::Planning));
        assert!(run.request_approval("x").is_err());
        assert!(run.complete().is_err());
        assert!(run.fail("again").is_err());
        assert!(!run.approval_required());
        assert_eq!(run.failure(), Some("agent failed"));
    }

    #[test]
    fn outputs_are_set_once() {
        let mut run = PipelineRun::new("r");
        run.record_output(Stage::Planning, "plan").unwrap();
        assert!(matches!(
            run.record_output(Stage::Planning, "other"),
            Err(PipelineError::OutputAlreadyRecorded { stage: Stage::Planning })
        ));
        assert!(matches!(
            run.record_output(Stage::Failed, "x"),
            Err(PipelineError::NoOutputSlot { .. })
        ));
        assert_eq!(run.outputs().plan.as_deref(), Some("plan"));
    }

    #[test]
    fn revision_counter_is_bounded() {
        let mut run = PipelineRun::new("r");
        run.record_output(Stage::Coding, "initial").unwrap();
        assert_eq!(run.effective_patch(), Some("initial"));

        assert_eq!(run.begin_revision(2).unwrap(), 1);
        run.record_revision(RevisionRecord {
            iteration: 1,
            patch: "second".to_string(),
            review: "ok".to_string(),
            verdict: ReviewVerdict::Approve,
        });
        assert_eq!(run.begin_revision(2).unwrap(), 2);
        assert!(matches!(
            run.begin_revision(2),
            Err(PipelineError::RevisionExhausted { iterations: 2 })
        ));
        assert_eq!(run.revision_count(), 2);
        assert_eq!(run.effective_patch(), Some("second"));
    }

    #[test]
    fn run_serializes() {
        let run = PipelineRun::new("serialize me");
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["request"], "serialize me");
        assert_eq!(json["stage"], "not_started");
    }
}
