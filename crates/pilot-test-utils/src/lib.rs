//! Testing utilities for the Pilot workspace
//!
//! Scripted agents, throwaway projects and payload builders.

#![allow(missing_docs)]

use pilot_core::{Agent, AgentContext, AgentRegistry, AgentResult, Stage};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Script {
    responses: VecDeque<AgentResult>,
    last: Option<AgentResult>,
    inputs: Vec<String>,
    contexts: Vec<AgentContext>,
}

/// Agent that replays queued responses; the last one repeats
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    script: Mutex<Script>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent that always answers `output`
    pub fn always(output: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new().with_response(output))
    }

    pub fn with_response(self, output: impl Into<String>) -> Self {
        self.push(AgentResult::ok(output))
    }

    pub fn with_failure(self, error: impl Into<String>) -> Self {
        self.push(AgentResult::failed(error))
    }

    fn push(self, result: AgentResult) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .responses
            .push_back(result);
        self
    }

    pub fn calls(&self) -> usize {
        self.lock().inputs.len()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.lock().inputs.clone()
    }

    pub fn contexts(&self) -> Vec<AgentContext> {
        self.lock().contexts.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Agent for ScriptedAgent {
    async fn execute(
        &self,
        input: &str,
        context: &AgentContext,
        _cancel: &CancellationToken,
    ) -> AgentResult {
        let mut script = self.lock();
        script.inputs.push(input.to_string());
        script.contexts.push(context.clone());
        match script.responses.pop_front() {
            Some(result) => {
                script.last = Some(result.clone());
                result
            }
            None => script
                .last
                .clone()
                .unwrap_or_else(|| AgentResult::failed("script exhausted")),
        }
    }
}

/// Agent that never answers until cancelled
#[derive(Debug, Default)]
pub struct HangingAgent;

#[async_trait::async_trait]
impl Agent for HangingAgent {
    async fn execute(
        &self,
        _input: &str,
        _context: &AgentContext,
        cancel: &CancellationToken,
    ) -> AgentResult {
        cancel.cancelled().await;
        AgentResult::failed("cancelled")
    }
}

/// Agent that cancels a token once called, then answers after a delay
#[derive(Debug)]
pub struct CancellingAgent {
    trigger: CancellationToken,
    delay: Duration,
}

impl CancellingAgent {
    pub fn new(trigger: CancellationToken) -> Self {
        Self {
            trigger,
            delay: Duration::from_millis(50),
        }
    }
}

#[async_trait::async_trait]
impl Agent for CancellingAgent {
    async fn execute(
        &self,
        _input: &str,
        _context: &AgentContext,
        _cancel: &CancellationToken,
    ) -> AgentResult {
        self.trigger.cancel();
        tokio::time::sleep(self.delay).await;
        AgentResult::ok("too late")
    }
}

/// One scripted agent per working stage
#[derive(Debug, Clone)]
pub struct StageAgents {
    pub planning: Arc<ScriptedAgent>,
    pub coding: Arc<ScriptedAgent>,
    pub reviewing: Arc<ScriptedAgent>,
    pub testing: Arc<ScriptedAgent>,
    pub evaluating: Arc<ScriptedAgent>,
}

impl StageAgents {
    /// Agents answering a clean, approvable single-file change
    pub fn happy() -> Self {
        Self {
            planning: ScriptedAgent::always(PlanPayload::new().to_json()),
            coding: ScriptedAgent::always(diff_fence(APPEND_DIFF)),
            reviewing: ScriptedAgent::always(review_json("APPROVE", "looks good", &[])),
            testing: ScriptedAgent::always("test result: ok. 3 passed; 0 failed"),
            evaluating: ScriptedAgent::always(evaluation_json(8.0, "ACCEPT")),
        }
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<ScriptedAgent>> {
        match stage {
            Stage::Planning => Some(&self.planning),
            Stage::Coding => Some(&self.coding),
            Stage::Reviewing => Some(&self.reviewing),
            Stage::Testing => Some(&self.testing),
            Stage::Evaluating => Some(&self.evaluating),
            _ => None,
        }
    }

    pub fn registry(&self) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for stage in Stage::WORKING {
            if let Some(agent) = self.get(stage) {
                let agent: Arc<dyn Agent> = agent.clone();
                registry.register(stage, agent).unwrap();
            }
        }
        registry
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Original content of `src/lib.rs` in [`ProjectFixture::rust_crate`]
pub const LIB_RS: &str = "pub fn answer() -> u32 {\n    42\n}\n";

/// Adds a function to the end of [`LIB_RS`]
pub const APPEND_DIFF: &str = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,7 @@
 pub fn answer() -> u32 {
     42
 }
+
+pub fn double() -> u32 {
+    answer() * 2
+}
";

/// Context that does not match [`LIB_RS`]
pub const STALE_DIFF: &str = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,3 @@
 pub fn answer() -> u64 {
-    42
+    43
 }
";

/// Temporary project directory
#[derive(Debug)]
pub struct ProjectFixture {
    dir: tempfile::TempDir,
}

impl ProjectFixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Small crate with `Cargo.toml` and `src/lib.rs`
    pub fn rust_crate() -> Self {
        Self::new()
            .with_file("Cargo.toml", "[package]\nname = \"demo\"\nversion = \"0.1.0\"\n")
            .with_file("src/lib.rs", LIB_RS)
    }

    pub fn with_file(self, relative: &str, content: &str) -> Self {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(relative)).unwrap()
    }

    /// Every file under the project with its content, sorted by path
    pub fn contents(&self) -> Vec<(PathBuf, Vec<u8>)> {
        read_tree(self.dir.path())
    }
}

impl Default for ProjectFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Every file under `root` with its content, sorted by relative path
pub fn read_tree(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                files.push((relative, std::fs::read(&path).unwrap()));
            }
        }
    }
    files.sort();
    files
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Builder for planning output JSON
#[derive(Debug, Clone)]
pub struct PlanPayload {
    steps: Vec<(String, f64)>,
    files: Vec<(String, String)>,
    risk: String,
    needs_approval: bool,
    approval_reason: Option<String>,
    omit: Vec<&'static str>,
}

impl PlanPayload {
    /// One small step modifying `src/lib.rs` at low risk
    pub fn new() -> Self {
        Self {
            steps: vec![("add double()".to_string(), 5.0)],
            files: vec![("src/lib.rs".to_string(), "modify".to_string())],
            risk: "low".to_string(),
            needs_approval: false,
            approval_reason: None,
            omit: Vec::new(),
        }
    }

    pub fn with_steps(mut self, estimates: &[f64]) -> Self {
        self.steps = estimates
            .iter()
            .enumerate()
            .map(|(i, loc)| (format!("step {}", i + 1), *loc))
            .collect();
        self
    }

    pub fn with_file(mut self, path: &str, operation: &str) -> Self {
        self.files.push((path.to_string(), operation.to_string()));
        self
    }

    pub fn with_risk(mut self, level: &str) -> Self {
        self.risk = level.to_string();
        self
    }

    pub fn requesting_approval(mut self, reason: &str) -> Self {
        self.needs_approval = true;
        self.approval_reason = Some(reason.to_string());
        self
    }

    /// Leave out a required field
    pub fn without(mut self, field: &'static str) -> Self {
        self.omit.push(field);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "plan": self.steps.iter()
                .map(|(d, loc)| json!({"description": d, "estimated_loc": loc}))
                .collect::<Vec<_>>(),
            "file_list": self.files.iter()
                .map(|(p, op)| json!({"path": p, "operation": op}))
                .collect::<Vec<_>>(),
            "risk": {"level": self.risk, "rationale": "fixture"},
            "verify": ["cargo test"],
            "rollback": "git checkout -- .",
            "needs_approval": self.needs_approval,
            "approval_reason": self.approval_reason,
        });
        if let Some(map) = value.as_object_mut() {
            for field in &self.omit {
                map.remove(*field);
            }
        }
        value
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

impl Default for PlanPayload {
    fn default() -> Self {
        Self::new()
    }
}

/// Reviewing output JSON; `issues` are `(severity, message)` pairs
pub fn review_json(verdict: &str, summary: &str, issues: &[(&str, &str)]) -> String {
    json!({
        "verdict": verdict,
        "summary": summary,
        "issues": issues.iter()
            .map(|(severity, message)| json!({"severity": severity, "message": message}))
            .collect::<Vec<_>>(),
    })
    .to_string()
}

/// Evaluating output JSON
pub fn evaluation_json(score: f64, verdict: &str) -> String {
    json!({"evaluation": {"overall_score": score, "final_verdict": verdict}}).to_string()
}

/// Diff wrapped in prose and a fenced block, as agents tend to answer
pub fn diff_fence(diff: &str) -> String {
    format!("Here is the change:\n\n```diff\n{diff}```\n")
}
