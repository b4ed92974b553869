//! Stage input assembly
//!
//! Inputs are tagged sections so an agent can find the parts it needs:
//!
//! ```text
//! <stage>coding</stage>
//! <request>
//! ...
//! </request>
//! <plan>
//! ...
//! </plan>
//! ```

use crate::payload::ReviewOutput;
use crate::stage::Stage;
use std::path::PathBuf;

/// Builder for one stage's input text
#[derive(Debug, Clone)]
pub struct StageInput {
    stage: Stage,
    sections: Vec<(&'static str, String)>,
}

impl StageInput {
    /// Start input for `stage`
    #[must_use]
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            sections: Vec::new(),
        }
    }

    /// Add a section; empty content is skipped
    #[must_use]
    pub fn section(mut self, tag: &'static str, content: impl Into<String>) -> Self {
        let content = content.into();
        if !content.trim().is_empty() {
            self.sections.push((tag, content));
        }
        self
    }

    /// Render
    #[must_use]
    pub fn build(self) -> String {
        let mut out = format!("<stage>{}</stage>\n", self.stage);
        for (tag, content) in self.sections {
            out.push_str(&format!("<{tag}>\n{}\n</{tag}>\n", content.trim_end()));
        }
        out
    }
}

pub(crate) fn planning(request: &str) -> String {
    StageInput::new(Stage::Planning)
        .section("request", request)
        .build()
}

pub(crate) fn coding(request: &str, plan: &str) -> String {
    StageInput::new(Stage::Coding)
        .section("request", request)
        .section("plan", plan)
        .build()
}

pub(crate) fn revision(
    request: &str,
    plan: &str,
    previous_patch: &str,
    review: &ReviewOutput,
    iteration: u32,
) -> String {
    StageInput::new(Stage::Coding)
        .section("request", request)
        .section("plan", plan)
        .section("previous-patch", previous_patch)
        .section("review-feedback", review.feedback())
        .section("revision", iteration.to_string())
        .build()
}

pub(crate) fn reviewing(request: &str, plan: &str, patch: &str) -> String {
    StageInput::new(Stage::Reviewing)
        .section("request", request)
        .section("plan", plan)
        .section("patch", patch)
        .build()
}

pub(crate) fn testing(request: &str, touched: &[PathBuf]) -> String {
    let files: Vec<String> = touched.iter().map(|p| p.display().to_string()).collect();
    StageInput::new(Stage::Testing)
        .section("request", request)
        .section("changed-files", files.join("\n"))
        .build()
}

pub(crate) fn evaluating(
    request: &str,
    plan: &str,
    patch: &str,
    review: &str,
    test_report: &str,
) -> String {
    StageInput::new(Stage::Evaluating)
        .section("request", request)
        .section("plan", plan)
        .section("patch", patch)
        .section("review", review)
        .section("test-report", test_report)
        .build()
}
