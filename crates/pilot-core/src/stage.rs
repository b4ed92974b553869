//! Pipeline stages and the legal transitions between them
//!
//! Success path:
//! `NotStarted -> Planning -> Coding -> Reviewing -> Testing -> Evaluating -> Completed`.
//! Any non-terminal stage may go to `Failed`; only `Planning` may go to
//! `AwaitingApproval`.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Stage of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    Planning,
    Coding,
    Reviewing,
    Testing,
    Evaluating,
    Completed,
    Failed,
    AwaitingApproval,
}

impl Stage {
    /// Stages performed by an agent, in execution order
    pub const WORKING: [Stage; 5] = [
        Stage::Planning,
        Stage::Coding,
        Stage::Reviewing,
        Stage::Testing,
        Stage::Evaluating,
    ];

    /// Whether the run ends here
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::AwaitingApproval)
    }

    /// Whether an agent performs this stage
    #[inline]
    #[must_use]
    pub const fn is_working(self) -> bool {
        matches!(
            self,
            Self::Planning | Self::Coding | Self::Reviewing | Self::Testing | Self::Evaluating
        )
    }

    /// Next stage on the success path
    #[must_use]
    pub const fn next(self) -> Option<Stage> {
        match self {
            Self::NotStarted => Some(Self::Planning),
            Self::Planning => Some(Self::Coding),
            Self::Coding => Some(Self::Reviewing),
            Self::Reviewing => Some(Self::Testing),
            Self::Testing => Some(Self::Evaluating),
            Self::Evaluating => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::AwaitingApproval => None,
        }
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::Reviewing => "reviewing",
            Self::Testing => "testing",
            Self::Evaluating => "evaluating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AwaitingApproval => "awaiting_approval",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stages reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: Stage) -> Vec<Stage> {
    use Stage::*;
    match from {
        NotStarted => vec![Planning, Failed],
        Planning => vec![Coding, Failed, AwaitingApproval],
        Coding => vec![Reviewing, Failed],
        Reviewing => vec![Testing, Failed],
        Testing => vec![Evaluating, Failed],
        Evaluating => vec![Completed, Failed],
        Completed | Failed | AwaitingApproval => vec![],
    }
}

/// Check a single transition
pub fn validate_transition(from: Stage, to: Stage) -> Result<(), PipelineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(PipelineError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_path_follows_next() {
        let mut stage = Stage::NotStarted;
        let mut path = vec![stage];
        while let Some(next) = stage.next() {
            validate_transition(stage, next).unwrap();
            stage = next;
            path.push(stage);
        }
        assert_eq!(path.len(), 7);
        assert_eq!(stage, Stage::Completed);
    }

    #[test]
    fn only_planning_reaches_awaiting_approval() {
        for from in Stage::WORKING {
            let ok = validate_transition(from, Stage::AwaitingApproval).is_ok();
            assert_eq!(ok, from == Stage::Planning, "{from}");
        }
    }

    #[test]
    fn terminal_stages_are_dead_ends() {
        for stage in [Stage::Completed, Stage::Failed, Stage::AwaitingApproval] {
            assert!(stage.is_terminal());
            assert!(allowed_transitions(stage).is_empty());
        }
    }

    #[test]
    fn display_matches_serde_name() {
        let json = serde_json::to_string(&Stage::AwaitingApproval).unwrap();
        assert_eq!(json, format!("\"{}\"", Stage::AwaitingApproval));
    }
}
