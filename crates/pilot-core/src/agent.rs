//! Agent gateway
//!
//! An [`Agent`] performs one stage: it receives text input, a metadata map and
//! a cancellation token, and returns an [`AgentResult`]. The controller looks
//! agents up by [`Stage`] in an [`AgentRegistry`] and never depends on how an
//! agent produces its output.

use crate::error::PipelineError;
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Metadata passed alongside the input
pub type AgentContext = Map<String, Value>;

/// Outcome of one agent call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration: Option<Duration>,
}

impl AgentResult {
    /// Successful result
    #[must_use]
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            duration: None,
        }
    }

    /// Failed result
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration: None,
        }
    }

    /// With measured duration
    #[inline]
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Stage agent
///
/// Implementations should return promptly once `cancel` fires; the
/// controller stops waiting either way.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    /// Perform the stage
    async fn execute(
        &self,
        input: &str,
        context: &AgentContext,
        cancel: &CancellationToken,
    ) -> AgentResult;
}

/// Stage to agent lookup table
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<Stage, Arc<dyn Agent>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<_> = self.agents.keys().collect();
        stages.sort();
        f.debug_struct("AgentRegistry")
            .field("stages", &stages)
            .finish()
    }
}

impl AgentRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the agent for a working stage, replacing any previous one
    pub fn register(&mut self, stage: Stage, agent: Arc<dyn Agent>) -> Result<(), PipelineError> {
        if !stage.is_working() {
            return Err(PipelineError::Config(format!(
                "{stage} is not performed by an agent"
            )));
        }
        self.agents.insert(stage, agent);
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, stage: Stage, agent: Arc<dyn Agent>) -> Result<Self, PipelineError> {
        self.register(stage, agent)?;
        Ok(self)
    }

    /// Agent for `stage`
    #[must_use]
    pub fn get(&self, stage: Stage) -> Option<Arc<dyn Agent>> {
        self.agents.get(&stage).cloned()
    }

    /// Working stages without an agent
    #[must_use]
    pub fn missing(&self) -> Vec<Stage> {
        Stage::WORKING
            .into_iter()
            .filter(|s| !self.agents.contains_key(s))
            .collect()
    }

    /// Fail unless every working stage has an agent
    pub fn validate(&self) -> Result<(), PipelineError> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
        Err(PipelineError::Config(format!(
            "no agent registered for: {}",
            names.join(", ")
        )))
    }
}

/// Agent backed by an external program
///
/// The input is written to stdin and stdout is the output. Each context entry
/// is exported as `PILOT_<KEY>` and the whole map as JSON in `PILOT_CONTEXT`.
/// A non-zero exit fails the call with stderr as the message. The child is
/// killed if the call is cancelled or dropped.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl CommandAgent {
    /// Create agent running `program`
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// With arguments
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// With an extra environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// With fixed working directory; defaults to the run's workspace
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self, context: &AgentContext) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in context {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            cmd.env(format!("PILOT_{}", key.to_ascii_uppercase()), rendered);
        }
        cmd.env("PILOT_CONTEXT", Value::Object(context.clone()).to_string());
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));

        let cwd = self.working_dir.clone().or_else(|| {
            context
                .get("workspace_root")
                .and_then(Value::as_str)
                .map(PathBuf::from)
        });
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run(&self, input: &str, context: &AgentContext) -> AgentResult {
        let mut child = match self.command(context).spawn() {
            Ok(child) => child,
            Err(e) => {
                return AgentResult::failed(format!(
                    "failed to spawn {}: {e}",
                    self.program.display()
                ));
            }
        };

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A child that never reads stdin closes the pipe early.
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!(error = %e, "agent stdin closed early");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());

        let output = match output {
            Ok(output) => output,
            Err(e) => return AgentResult::failed(format!("agent process error: {e}")),
        };
        if output.status.success() {
            AgentResult::ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("agent exited with {}", output.status)
            } else {
                stderr
            };
            AgentResult::failed(message)
        }
    }
}

#[async_trait::async_trait]
impl Agent for CommandAgent {
    async fn execute(
        &self,
        input: &str,
        context: &AgentContext,
        cancel: &CancellationToken,
    ) -> AgentResult {
        let started = Instant::now();
        tracing::debug!(program = %self.program.display(), "spawning agent process");
        let result = tokio::select! {
            () = cancel.cancelled() => AgentResult::failed("cancelled"),
            result = self.run(input, context) => result,
        };
        result.with_duration(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reports_missing_stages() {
        let mut registry = AgentRegistry::new();
        let agent: Arc<dyn Agent> = Arc::new(MockAgent::new());
        registry.register(Stage::Planning, agent.clone()).unwrap();
        registry.register(Stage::Coding, agent).unwrap();

        assert_eq!(
            registry.missing(),
            vec![Stage::Reviewing, Stage::Testing, Stage::Evaluating]
        );
        let err = registry.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: no agent registered for: reviewing, testing, evaluating"
        );
    }

    #[test]
    fn registry_rejects_non_working_stage() {
        let mut registry = AgentRegistry::new();
        let agent: Arc<dyn Agent> = Arc::new(MockAgent::new());
        assert!(registry.register(Stage::Completed, agent).is_err());
    }

    #[tokio::test]
    async fn mock_agent_receives_input() {
        let mut mock = MockAgent::new();
        mock.expect_execute()
            .withf(|input, _, _| input == "hello")
            .times(1)
            .returning(|input, _, _| AgentResult::ok(input.to_uppercase()));

        let result = mock
            .execute("hello", &AgentContext::new(), &CancellationToken::new())
            .await;
        assert_eq!(result, AgentResult::ok("HELLO"));
    }

    #[cfg(unix)]
    fn context() -> AgentContext {
        let mut ctx = AgentContext::new();
        ctx.insert("stage".to_string(), Value::from("coding"));
        ctx.insert("iteration".to_string(), Value::from(2));
        ctx
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_agent_pipes_stdin_to_stdout() {
        let agent = CommandAgent::new("cat");
        let result = agent
            .execute("diff text", &AgentContext::new(), &CancellationToken::new())
            .await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.output, "diff text");
        assert!(result.duration.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_agent_exports_context() {
        let agent = CommandAgent::new("sh")
            .with_args(["-c", r#"printf '%s|%s|%s' "$PILOT_STAGE" "$PILOT_ITERATION" "$EXTRA""#])
            .with_env("EXTRA", "x");
        let result = agent
            .execute("", &context(), &CancellationToken::new())
            .await;
        assert_eq!(result.output, "coding|2|x");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_agent_failure_uses_stderr() {
        let agent = CommandAgent::new("sh").with_args(["-c", "echo broken >&2; exit 3"]);
        let result = agent
            .execute("", &AgentContext::new(), &CancellationToken::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_agent_stops_on_cancel() {
        let agent = CommandAgent::new("sleep").with_args(["30"]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = agent.execute("", &AgentContext::new(), &cancel).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_fails_cleanly() {
        let agent = CommandAgent::new("/definitely/not/a/program");
        let result = agent
            .execute("", &AgentContext::new(), &CancellationToken::new())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("failed to spawn"));
    }
}
