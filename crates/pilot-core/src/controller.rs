//! Pipeline controller
//!
//! Drives one change request through the five stages:
//!
//! ```text
//! Planning -> [approval gate] -> Coding -> Reviewing <-> revisions
//!          -> Testing -> Evaluating -> Completed
//! ```
//!
//! All file changes happen in a per-run [`WorkspaceStore`]; the user's
//! project is only ever read. The workspace is released on every exit path.

use crate::agent::{AgentContext, AgentRegistry};
use crate::approval::ApprovalGate;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::payload::{
    decode_evaluation, decode_plan, decode_review, extract_diff, FinalVerdict, ReviewVerdict,
};
use crate::prompt;
use crate::result::{PipelineOutcome, PipelineResult};
use crate::run::{PipelineRun, RevisionRecord};
use crate::stage::Stage;
use pilot_workspace::{PatchEngine, Released, RollbackFailure, RollbackReport, WorkspaceStore};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How `drive` stopped without error
enum Flow {
    Completed,
    AwaitingApproval,
}

/// Runs change requests through the staged agents
#[derive(Debug, Clone)]
pub struct PipelineController {
    config: PipelineConfig,
    registry: AgentRegistry,
    gate: ApprovalGate,
}

impl PipelineController {
    /// Create controller
    #[must_use]
    pub fn new(config: PipelineConfig, registry: AgentRegistry) -> Self {
        let gate = ApprovalGate::new(config.approval);
        Self {
            config,
            registry,
            gate,
        }
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Agents in use
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Run `request` against a copy of `project_root`
    ///
    /// Never returns an error: every failure, including cancellation and
    /// invalid configuration, ends as [`PipelineOutcome::Failed`].
    pub async fn run(
        &self,
        request: impl Into<String>,
        project_root: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let run = PipelineRun::new(request);
        let span = tracing::info_span!("pipeline", run_id = %run.id());
        self.run_in_span(run, project_root.as_ref(), cancel)
            .instrument(span)
            .await
    }

    async fn run_in_span(
        &self,
        mut run: PipelineRun,
        project_root: &Path,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        tracing::info!(project = %project_root.display(), "pipeline started");

        if let Err(e) = self.config.validate().and_then(|()| self.registry.validate()) {
            return finish(run, Err(e), None, Vec::new());
        }
        if let Err(e) = checkpoint(&run, cancel) {
            return finish(run, Err(e), None, Vec::new());
        }

        let store = match WorkspaceStore::create(
            &self.config.workspace.base_dir,
            &run.id().to_string(),
            self.config.workspace.retention,
        )
        .await
        {
            Ok(store) => store,
            Err(e) => return finish(run, Err(e.into()), None, Vec::new()),
        };
        run.attach_workspace(store.root());

        let mut rollback_failures = Vec::new();
        let flow = self
            .drive(&mut run, &store, project_root, cancel, &mut rollback_failures)
            .await;

        let root = store.root().to_path_buf();
        let workspace = match store.release().await {
            Ok(Released::Kept(path)) => Some(path),
            Ok(Released::Removed(_)) => None,
            Err(e) => {
                tracing::warn!(error = %e, "workspace release failed");
                Some(root)
            }
        };

        finish(run, flow, workspace, rollback_failures)
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        store: &WorkspaceStore,
        project_root: &Path,
        cancel: &CancellationToken,
        rollback_failures: &mut Vec<RollbackFailure>,
    ) -> Result<Flow, PipelineError> {
        let populated = store
            .populate(project_root, &self.config.workspace.populate_options())
            .await?;
        tracing::info!(
            files = populated.files_copied,
            bytes = populated.bytes_copied,
            skipped = populated.skipped.len(),
            "workspace populated"
        );
        let mut engine = PatchEngine::new(store);

        // Planning
        enter(run, Stage::Planning, cancel)?;
        let input = prompt::planning(run.request());
        let plan_text = self.invoke(run, Stage::Planning, &input, cancel).await?;
        run.record_output(Stage::Planning, plan_text.clone())?;
        let plan = decode_plan(&plan_text)?;
        tracing::debug!(steps = plan.plan.len(), files = plan.file_list.len(), risk = ?plan.risk.level, "plan decoded");

        let decision = self.gate.evaluate(&plan);
        if let Some(reason) = decision.reason() {
            tracing::warn!(reasons = ?decision.reasons, "plan requires approval");
            run.request_approval(reason)?;
            return Ok(Flow::AwaitingApproval);
        }

        // Coding
        enter(run, Stage::Coding, cancel)?;
        let input = prompt::coding(run.request(), &plan_text);
        let mut patch = self.invoke(run, Stage::Coding, &input, cancel).await?;
        run.record_output(Stage::Coding, patch.clone())?;
        apply_patch(run, &mut engine, &patch, rollback_failures).await?;

        // Reviewing, with revision cycles
        enter(run, Stage::Reviewing, cancel)?;
        let input = prompt::reviewing(run.request(), &plan_text, &patch);
        let mut review_text = self.invoke(run, Stage::Reviewing, &input, cancel).await?;
        let mut review = decode_review(&review_text);

        while review.verdict == ReviewVerdict::Revise {
            let iteration = match run.begin_revision(self.config.max_revision_iterations) {
                Ok(iteration) => iteration,
                Err(e) => {
                    run.record_output(Stage::Reviewing, review_text)?;
                    return Err(e);
                }
            };
            tracing::info!(iteration, issues = review.issues.len(), "review requested revision");

            checkpoint(run, cancel)?;
            let input = prompt::revision(run.request(), &plan_text, &patch, &review, iteration);
            let revised = self.invoke(run, Stage::Coding, &input, cancel).await?;

            // Revisions replace the previous patch rather than stack on it.
            let report = engine.rollback().await;
            note_rollback(&report, rollback_failures);
            run.set_applied_files(Vec::new());
            apply_patch(run, &mut engine, &revised, rollback_failures).await?;

            checkpoint(run, cancel)?;
            let input = prompt::reviewing(run.request(), &plan_text, &revised);
            review_text = self.invoke(run, Stage::Reviewing, &input, cancel).await?;
            review = decode_review(&review_text);

            run.record_revision(RevisionRecord {
                iteration,
                patch: revised.clone(),
                review: review_text.clone(),
                verdict: review.verdict,
            });
            patch = revised;
        }
        run.record_output(Stage::Reviewing, review_text.clone())?;

        match review.verdict {
            ReviewVerdict::Reject => {
                return Err(PipelineError::ReviewRejected {
                    summary: review.summary,
                });
            }
            ReviewVerdict::Unknown => {
                tracing::warn!("review verdict not recognised; continuing");
            }
            ReviewVerdict::Approve | ReviewVerdict::Revise => {}
        }

        // Testing
        enter(run, Stage::Testing, cancel)?;
        let input = prompt::testing(run.request(), run.touched_files());
        let test_report = self.invoke(run, Stage::Testing, &input, cancel).await?;
        run.record_output(Stage::Testing, test_report.clone())?;

        // Evaluating
        enter(run, Stage::Evaluating, cancel)?;
        let input =
            prompt::evaluating(run.request(), &plan_text, &patch, &review_text, &test_report);
        let evaluation_text = self.invoke(run, Stage::Evaluating, &input, cancel).await?;
        run.record_output(Stage::Evaluating, evaluation_text.clone())?;

        let evaluation = decode_evaluation(&evaluation_text);
        tracing::info!(
            score = evaluation.overall_score,
            verdict = %evaluation.final_verdict,
            "evaluation decoded"
        );
        if evaluation.final_verdict == FinalVerdict::Reject {
            return Err(PipelineError::EvaluationRejected {
                score: evaluation.overall_score,
                reason: "final verdict is REJECT".to_string(),
            });
        }
        let threshold = self.config.min_evaluation_score;
        if evaluation.overall_score < threshold {
            return Err(PipelineError::EvaluationRejected {
                score: evaluation.overall_score,
                reason: format!(
                    "overall score {} below threshold {threshold}",
                    evaluation.overall_score
                ),
            });
        }

        let committed = engine.commit();
        tracing::debug!(changes = committed, "workspace changes committed");
        run.complete()?;
        Ok(Flow::Completed)
    }

    /// Call the agent for `stage`, honouring cancellation and the timeout
    async fn invoke(
        &self,
        run: &PipelineRun,
        stage: Stage,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let agent = self
            .registry
            .get(stage)
            .ok_or_else(|| PipelineError::Config(format!("no agent registered for: {stage}")))?;
        let context = agent_context(run, stage);

        tracing::debug!(%stage, input_bytes = input.len(), "invoking agent");
        let started = Instant::now();
        let call = async {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(PipelineError::Cancelled { stage: run.stage() }),
                result = agent.execute(input, &context, cancel) => Ok(result),
            }
        };
        let result = match self.config.agent_timeout() {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                PipelineError::AgentFailure {
                    stage,
                    message: format!("timed out after {}s", limit.as_secs()),
                }
            })??,
            None => call.await?,
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(%stage, elapsed_ms, success = result.success, "agent finished");

        if !result.success {
            return Err(PipelineError::AgentFailure {
                stage,
                message: result
                    .error
                    .unwrap_or_else(|| "agent reported failure without a message".to_string()),
            });
        }
        Ok(result.output)
    }
}

fn agent_context(run: &PipelineRun, stage: Stage) -> AgentContext {
    let mut context = AgentContext::new();
    context.insert("run_id".to_string(), Value::from(run.id().to_string()));
    context.insert("stage".to_string(), Value::from(stage.as_str()));
    context.insert("request".to_string(), Value::from(run.request()));
    context.insert("iteration".to_string(), Value::from(run.revision_count()));
    if let Some(root) = run.workspace_root() {
        context.insert(
            "workspace_root".to_string(),
            Value::from(root.display().to_string()),
        );
    }
    context
}

fn checkpoint(run: &PipelineRun, cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled { stage: run.stage() });
    }
    Ok(())
}

fn enter(run: &mut PipelineRun, stage: Stage, cancel: &CancellationToken) -> Result<(), PipelineError> {
    checkpoint(run, cancel)?;
    run.advance_stage(stage)
}

/// Apply a coding output; a failure leaves the workspace as it was
async fn apply_patch(
    run: &mut PipelineRun,
    engine: &mut PatchEngine<'_>,
    output: &str,
    rollback_failures: &mut Vec<RollbackFailure>,
) -> Result<(), PipelineError> {
    let result = engine
        .apply_diff(extract_diff(output))
        .await
        .map_err(|e| PipelineError::PatchApplication(e.to_string()))?;
    if let Some(report) = &result.rollback {
        note_rollback(report, rollback_failures);
    }
    if !result.success {
        return Err(PipelineError::PatchApplication(
            result
                .error
                .unwrap_or_else(|| "patch was not applied".to_string()),
        ));
    }
    run.set_applied_files(result.touched_paths());
    Ok(())
}

fn note_rollback(report: &RollbackReport, failures: &mut Vec<RollbackFailure>) {
    for failure in &report.failures {
        tracing::warn!(path = %failure.path.display(), error = %failure.message, "change could not be undone");
    }
    failures.extend(report.failures.iter().cloned());
}

fn finish(
    mut run: PipelineRun,
    flow: Result<Flow, PipelineError>,
    workspace: Option<PathBuf>,
    rollback_failures: Vec<RollbackFailure>,
) -> PipelineResult {
    let outcome = match flow {
        Ok(Flow::Completed) => {
            tracing::info!(files = run.touched_files().len(), revisions = run.revision_count(), "pipeline completed");
            PipelineOutcome::Completed
        }
        Ok(Flow::AwaitingApproval) => {
            let reason = run.approval_reason().unwrap_or_default().to_string();
            tracing::info!("pipeline stopped for approval");
            PipelineOutcome::ApprovalRequired { reason }
        }
        Err(e) => {
            let reason = e.to_string();
            let stage = run.stage();
            if e.is_cancelled() {
                tracing::warn!(%stage, "pipeline cancelled");
            } else {
                tracing::error!(%stage, error = %reason, "pipeline failed");
            }
            if let Err(err) = run.fail(reason.clone()) {
                tracing::error!(error = %err, "could not mark run failed");
            }
            PipelineOutcome::Failed { stage, reason }
        }
    };

    PipelineResult {
        outcome,
        run,
        workspace,
        rollback_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentResult, MockAgent};
    use pilot_workspace::Retention;
    use std::sync::Arc;

    const PLAN: &str = r#"{"plan":[{"description":"add b","estimated_loc":3}],
        "file_list":[{"path":"src/lib.rs","operation":"modify"}],
        "risk":"low","verify":["cargo test"],"rollback":"revert the commit"}"#;

    const DIFF: &str = "```diff\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1,2 @@\n fn a() {}\n+fn b() {}\n```\n";

    fn agent(output: &'static str) -> Arc<MockAgent> {
        let mut mock = MockAgent::new();
        mock.expect_execute()
            .returning(move |_, _, _| AgentResult::ok(output));
        Arc::new(mock)
    }

    fn registry(outputs: [&'static str; 5]) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for (stage, output) in Stage::WORKING.into_iter().zip(outputs) {
            registry.register(stage, agent(output)).unwrap();
        }
        registry
    }

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn a() {}\n").unwrap();
        dir
    }

    fn config(base: &Path) -> PipelineConfig {
        PipelineConfig::default().with_workspace_dir(base)
    }

    #[tokio::test]
    async fn approved_change_completes_in_workspace() {
        let project = project();
        let base = tempfile::tempdir().unwrap();
        let controller = PipelineController::new(
            config(base.path()),
            registry([
                PLAN,
                DIFF,
                r#"{"verdict":"APPROVE","summary":"fine"}"#,
                "all tests pass",
                r#"{"overall_score":8.5,"final_verdict":"ACCEPT"}"#,
            ]),
        );

        let result = controller
            .run("add b", project.path(), &CancellationToken::new())
            .await;

        assert!(result.is_success(), "{}", result.summary());
        assert_eq!(result.run.history().len(), 5);
        assert_eq!(result.run.touched_files(), &[PathBuf::from("src/lib.rs")]);

        let workspace = result.workspace.unwrap();
        let changed = std::fs::read_to_string(workspace.join("src/lib.rs")).unwrap();
        assert_eq!(changed, "fn a() {}\nfn b() {}\n");
        let original = std::fs::read_to_string(project.path().join("src/lib.rs")).unwrap();
        assert_eq!(original, "fn a() {}\n");
    }

    #[tokio::test]
    async fn missing_agent_fails_before_workspace() {
        let project = project();
        let base = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new()
            .with(Stage::Planning, agent(PLAN))
            .unwrap();
        let controller = PipelineController::new(config(base.path()), registry);

        let result = controller
            .run("r", project.path(), &CancellationToken::new())
            .await;

        match &result.outcome {
            PipelineOutcome::Failed { stage, reason } => {
                assert_eq!(*stage, Stage::NotStarted);
                assert!(reason.contains("no agent registered for: coding"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(result.workspace.is_none());
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn evaluation_reject_fails_even_with_high_score() {
        let project = project();
        let base = tempfile::tempdir().unwrap();
        let controller = PipelineController::new(
            config(base.path()),
            registry([
                PLAN,
                DIFF,
                "VERDICT: APPROVE",
                "ok",
                r#"{"evaluation":{"overall_score":9,"final_verdict":"REJECT"}}"#,
            ]),
        );

        let result = controller
            .run("r", project.path(), &CancellationToken::new())
            .await;

        assert_eq!(result.run.failed_during(), Some(Stage::Evaluating));
        assert!(result.reason().unwrap().contains("final verdict is REJECT"));
    }

    #[tokio::test]
    async fn removed_workspace_is_not_reported() {
        let project = project();
        let base = tempfile::tempdir().unwrap();
        let controller = PipelineController::new(
            config(base.path()).with_retention(Retention::Remove),
            registry([
                PLAN,
                DIFF,
                "VERDICT: APPROVE",
                "ok",
                r#"{"overall_score":10,"final_verdict":"ACCEPT"}"#,
            ]),
        );

        let result = controller
            .run("r", project.path(), &CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert!(result.workspace.is_none());
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }
}
