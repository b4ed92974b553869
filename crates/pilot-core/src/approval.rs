//! Human approval checkpoint after planning
//!
//! [`ApprovalGate::evaluate`] is pure. Each tripped condition contributes one
//! line to the reason, in a fixed order:
//! 1. the plan asks for approval itself
//! 2. declared risk is high
//! 3. a step exceeds the per-step line estimate
//! 4. the plan has too many steps
//! 5. the plan deletes files

use crate::config::ApprovalPolicy;
use crate::payload::{PlanOutput, RiskLevel};
use serde::Serialize;

/// Gate result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApprovalDecision {
    /// Whether a human must sign off
    pub required: bool,
    /// One explanation per tripped condition
    pub reasons: Vec<String>,
}

impl ApprovalDecision {
    /// Reasons joined one per line; `None` when not required
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.required.then(|| self.reasons.join("\n"))
    }
}

/// Approval rule set
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalGate {
    policy: ApprovalPolicy,
}

impl ApprovalGate {
    /// Create gate with thresholds
    #[inline]
    #[must_use]
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self { policy }
    }

    /// Thresholds in use
    #[inline]
    #[must_use]
    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    /// Decide whether `plan` needs approval
    #[must_use]
    pub fn evaluate(&self, plan: &PlanOutput) -> ApprovalDecision {
        let mut reasons = Vec::new();

        if plan.needs_approval {
            let why = plan
                .approval_reason
                .as_deref()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or("no reason given");
            reasons.push(format!("plan requests approval: {why}"));
        }

        if plan.risk.level == RiskLevel::High {
            reasons.push("risk level is high".to_string());
        }

        let limit = f64::from(self.policy.max_step_loc);
        let oversized: Vec<String> = plan
            .plan
            .iter()
            .enumerate()
            .filter(|(_, step)| step.estimated_loc > limit)
            .map(|(i, step)| format!("step {} (~{} lines)", i + 1, step.estimated_loc))
            .collect();
        if !oversized.is_empty() {
            reasons.push(format!(
                "steps exceed {} estimated lines: {}",
                self.policy.max_step_loc,
                oversized.join(", ")
            ));
        }

        if plan.plan.len() > self.policy.max_steps {
            reasons.push(format!(
                "plan has {} steps (limit {})",
                plan.plan.len(),
                self.policy.max_steps
            ));
        }

        let deletions: Vec<&str> = plan.deletions().collect();
        if !deletions.is_empty() {
            reasons.push(format!("plan deletes files: {}", deletions.join(", ")));
        }

        ApprovalDecision {
            required: !reasons.is_empty(),
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{FileChange, PlanStep, RiskAssessment};
    use pilot_patch::FileOperation;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn plan(steps: &[f64]) -> PlanOutput {
        PlanOutput {
            plan: steps
                .iter()
                .map(|loc| PlanStep {
                    description: "step".to_string(),
                    estimated_loc: *loc,
                })
                .collect(),
            file_list: vec![FileChange {
                path: "src/lib.rs".to_string(),
                operation: FileOperation::Modify,
            }],
            risk: RiskAssessment {
                level: RiskLevel::Low,
                rationale: None,
            },
            verify: Value::Null,
            rollback: Value::Null,
            needs_approval: false,
            approval_reason: None,
            summary: None,
        }
    }

    #[test]
    fn clean_plan_passes() {
        let decision = ApprovalGate::default().evaluate(&plan(&[10.0, 300.0]));
        assert_eq!(decision, ApprovalDecision::default());
        assert_eq!(decision.reason(), None);
    }

    #[test]
    fn self_flag_carries_reason() {
        let mut p = plan(&[1.0]);
        p.needs_approval = true;
        p.approval_reason = Some("touches billing".to_string());
        let decision = ApprovalGate::default().evaluate(&p);
        assert_eq!(decision.reasons, vec!["plan requests approval: touches billing"]);
    }

    #[test]
    fn step_count_limit() {
        let decision = ApprovalGate::default().evaluate(&plan(&[1.0; 8]));
        assert_eq!(decision.reasons, vec!["plan has 8 steps (limit 7)"]);
    }

    #[test]
    fn every_condition_reported() {
        let mut p = plan(&[500.0; 8]);
        p.needs_approval = true;
        p.risk.level = RiskLevel::High;
        p.file_list.push(FileChange {
            path: "old.rs".to_string(),
            operation: FileOperation::Delete,
        });
        let decision = ApprovalGate::default().evaluate(&p);
        assert!(decision.required);
        assert_eq!(decision.reasons.len(), 5);
        assert_eq!(decision.reason().unwrap().lines().count(), 5);
    }
}
