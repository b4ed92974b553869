//! Pilot Core - staged change-request pipeline
//!
//! Turns a natural-language change request into a reviewed, tested change in
//! an isolated workspace:
//! - Plans the change and stops for human approval when the plan is risky
//! - Applies the coding agent's unified diff transactionally
//! - Loops review and revision up to a configured bound
//! - Gates completion on the evaluation verdict and score
//!
//! # Example
//!
//! ```rust,ignore
//! use pilot_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let agent: Arc<dyn Agent> = Arc::new(CommandAgent::new("my-agent"));
//! let mut registry = AgentRegistry::new();
//! for stage in Stage::WORKING {
//!     registry.register(stage, agent.clone())?;
//! }
//!
//! let controller = PipelineController::new(PipelineConfig::load("pilot.toml")?, registry);
//! let result = controller
//!     .run("Add a --verbose flag", "./my-project", &CancellationToken::new())
//!     .await;
//! println!("{}", result.summary());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod agent;
pub mod approval;
pub mod config;
pub mod controller;
pub mod error;
pub mod payload;
pub mod prompt;
pub mod result;
pub mod run;
pub mod stage;
pub mod telemetry;

// Re-exports for convenience
pub use agent::{Agent, AgentContext, AgentRegistry, AgentResult, CommandAgent};
pub use approval::{ApprovalDecision, ApprovalGate};
pub use config::{ApprovalPolicy, PipelineConfig, WorkspaceConfig};
pub use controller::PipelineController;
pub use error::PipelineError;
pub use payload::{
    decode_evaluation, decode_plan, decode_review, extract_diff, extract_structured,
    parse_review_verdict, parse_structured, EvaluationOutput, FileChange, FinalVerdict,
    PlanOutput, PlanStep, ReviewIssue, ReviewOutput, ReviewVerdict, RiskAssessment, RiskLevel,
    REQUIRED_PLAN_FIELDS,
};
pub use prompt::StageInput;
pub use result::{PipelineOutcome, PipelineResult};
pub use run::{PipelineRun, RevisionRecord, RunId, StageOutputs, StageTransition};
pub use stage::{allowed_transitions, validate_transition, Stage};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};

pub use tokio_util::sync::CancellationToken;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running pipelines
    pub use crate::{
        Agent, AgentContext, AgentRegistry, AgentResult, CancellationToken, CommandAgent,
        PipelineConfig, PipelineController, PipelineError, PipelineOutcome, PipelineResult,
        PipelineRun, Stage,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn config_round_trips_through_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            max_revision_iterations = 3
            min_evaluation_score = 6.5

            [approval]
            max_steps = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.max_revision_iterations, 3);
        assert_eq!(config.approval.max_steps, 4);
        assert_eq!(config.approval.max_step_loc, 300);

        let controller = PipelineController::new(config, AgentRegistry::new());
        assert_eq!(controller.config().min_evaluation_score, 6.5);
        assert_eq!(controller.registry().missing().len(), 5);
    }

    #[test]
    fn decoded_plan_feeds_the_gate() {
        let plan = decode_plan(
            r#"```json
{"plan":{"steps":["a","b"]},"file_list":[{"file":"x.rs","operation":"delete"}],
 "risk":{"level":"HIGH"},"verify":"cargo test","rollback":"git revert"}
```"#,
        )
        .unwrap();
        let decision = ApprovalGate::new(ApprovalPolicy::default()).evaluate(&plan);
        assert_eq!(
            decision.reasons,
            vec!["risk level is high", "plan deletes files: x.rs"]
        );
    }
}
