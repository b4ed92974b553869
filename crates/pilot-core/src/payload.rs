//! Decoding of structured stage outputs
//!
//! Agents return free text. Planning, reviewing and evaluating outputs carry
//! a structured object, optionally wrapped in a fenced code block or
//! surrounded by prose. JSON is tried first, then YAML.
//!
//! - [`decode_plan`] is strict: missing required fields fail the run.
//! - [`decode_review`] and [`decode_evaluation`] are lenient and fall back to
//!   `Unknown` verdicts and a zero score.

use crate::error::PipelineError;
use crate::stage::Stage;
use once_cell::sync::Lazy;
use pilot_patch::FileOperation;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{self, Display, Formatter};

/// Fields a planning object must carry
pub const REQUIRED_PLAN_FIELDS: [&str; 5] = ["plan", "file_list", "risk", "verify", "rollback"];

static FENCE_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[^\n]*\n(.*?)```").ok());

static VERDICT_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\bverdict\b[\s:*#_`'"-]*(approved?|reject(?:ed)?|revise|needs[\s_-]*revision|changes[\s_-]*requested)"#,
    )
    .ok()
});

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Declared risk of a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    #[default]
    Unknown,
}

impl From<String> for RiskLevel {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            _ => Self::Unknown,
        }
    }
}

/// `risk` object of a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRisk")]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub rationale: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRisk {
    Level(RiskLevel),
    Detailed {
        #[serde(default)]
        level: RiskLevel,
        #[serde(default, alias = "reason", alias = "notes")]
        rationale: Option<String>,
    },
}

impl From<RawRisk> for RiskAssessment {
    fn from(raw: RawRisk) -> Self {
        match raw {
            RawRisk::Level(level) => Self {
                level,
                rationale: None,
            },
            RawRisk::Detailed { level, rationale } => Self { level, rationale },
        }
    }
}

/// One plan step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawStep")]
pub struct PlanStep {
    pub description: String,
    pub estimated_loc: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStep {
    Text(String),
    Detailed {
        #[serde(default, alias = "step", alias = "title")]
        description: String,
        #[serde(default)]
        estimated_loc: f64,
    },
}

impl From<RawStep> for PlanStep {
    fn from(raw: RawStep) -> Self {
        match raw {
            RawStep::Text(description) => Self {
                description,
                estimated_loc: 0.0,
            },
            RawStep::Detailed {
                description,
                estimated_loc,
            } => Self {
                description,
                estimated_loc,
            },
        }
    }
}

/// One `file_list` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    #[serde(alias = "file")]
    pub path: String,
    pub operation: FileOperation,
}

/// Decoded planning output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutput {
    pub plan: Vec<PlanStep>,
    pub file_list: Vec<FileChange>,
    pub risk: RiskAssessment,
    pub verify: Value,
    pub rollback: Value,
    #[serde(default)]
    pub needs_approval: bool,
    #[serde(default)]
    pub approval_reason: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl PlanOutput {
    /// Paths the plan deletes
    pub fn deletions(&self) -> impl Iterator<Item = &str> {
        self.file_list
            .iter()
            .filter(|f| f.operation == FileOperation::Delete)
            .map(|f| f.path.as_str())
    }
}

/// Decode a planning output
///
/// `plan` may be a step array or an object with a `steps` array. Absent or
/// null required fields are reported together.
pub fn decode_plan(text: &str) -> Result<PlanOutput, PipelineError> {
    let mut map = parse_structured(text).ok_or_else(|| {
        PipelineError::malformed(Stage::Planning, "output contains no structured object")
    })?;

    let missing: Vec<String> = REQUIRED_PLAN_FIELDS
        .iter()
        .filter(|field| map.get(**field).map_or(true, Value::is_null))
        .map(ToString::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::missing_fields(Stage::Planning, missing));
    }

    let steps = match map.get_mut("plan") {
        Some(Value::Object(plan)) => plan.remove("steps"),
        _ => None,
    };
    if let Some(steps) = steps {
        map.insert("plan".to_string(), steps);
    }

    serde_json::from_value(Value::Object(map))
        .map_err(|e| PipelineError::malformed(Stage::Planning, e.to_string()))
}

// ---------------------------------------------------------------------------
// Reviewing
// ---------------------------------------------------------------------------

/// Review verdict
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", from = "String")]
pub enum ReviewVerdict {
    Approve,
    Reject,
    Revise,
    /// Unparsable; does not block the run
    #[default]
    Unknown,
}

impl From<String> for ReviewVerdict {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<&str> for ReviewVerdict {
    fn from(s: &str) -> Self {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        match normalized.as_str() {
            "APPROVE" | "APPROVED" | "ACCEPT" => Self::Approve,
            "REJECT" | "REJECTED" => Self::Reject,
            "REVISE" | "NEEDS_REVISION" | "CHANGES_REQUESTED" => Self::Revise,
            _ => Self::Unknown,
        }
    }
}

impl Display for ReviewVerdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Approve => "APPROVE",
            Self::Reject => "REJECT",
            Self::Revise => "REVISE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// One review finding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl Display for ReviewIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if !self.severity.is_empty() {
            write!(f, "[{}] ", self.severity)?;
        }
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{file}:{line}: ")?,
            (Some(file), None) => write!(f, "{file}: ")?,
            _ => {}
        }
        f.write_str(&self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (suggestion: {suggestion})")?;
        }
        Ok(())
    }
}

/// Decoded reviewing output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOutput {
    #[serde(default)]
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
}

impl ReviewOutput {
    /// Feedback text handed to the coding agent on revision
    #[must_use]
    pub fn feedback(&self) -> String {
        let mut out = format!("Verdict: {}\n", self.verdict);
        if !self.summary.is_empty() {
            out.push_str(&format!("Summary: {}\n", self.summary));
        }
        if !self.issues.is_empty() {
            out.push_str("Issues:\n");
            for issue in &self.issues {
                out.push_str(&format!("- {issue}\n"));
            }
        }
        out
    }
}

/// Decode a reviewing output; never fails
///
/// Fields are read one by one so an off-schema `summary` or issue never hides
/// the verdict. Issues that are neither objects nor strings are dropped. An
/// object without a usable `verdict` falls back to a textual
/// `VERDICT: <word>` scan of the whole output.
#[must_use]
pub fn decode_review(text: &str) -> ReviewOutput {
    let Some(map) = parse_structured(text) else {
        return ReviewOutput {
            verdict: scan_verdict(text),
            summary: text.trim().to_string(),
            issues: Vec::new(),
        };
    };

    let verdict = match map.get("verdict").and_then(scalar_text) {
        Some(word) => ReviewVerdict::from(word.as_str()),
        None => ReviewVerdict::Unknown,
    };
    let verdict = match verdict {
        ReviewVerdict::Unknown => scan_verdict(text),
        known => known,
    };

    let summary = map.get("summary").and_then(scalar_text).unwrap_or_default();
    let issues = match map.get("issues") {
        Some(Value::Array(items)) => items.iter().filter_map(ReviewIssue::from_value).collect(),
        _ => Vec::new(),
    };

    ReviewOutput {
        verdict,
        summary,
        issues,
    }
}

/// String form of a JSON scalar; `None` for null, arrays and objects
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl ReviewIssue {
    /// Lenient decode of one `issues` entry
    ///
    /// A bare string becomes the message. `line` accepts numbers and numeric
    /// strings; any other off-schema field is treated as absent.
    fn from_value(value: &Value) -> Option<Self> {
        let fields = match value {
            Value::String(message) => {
                return Some(Self {
                    message: message.clone(),
                    ..Self::default()
                });
            }
            Value::Object(fields) => fields,
            _ => return None,
        };
        let text = |key: &str| fields.get(key).and_then(scalar_text);
        let line = match fields.get("line") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        Some(Self {
            severity: text("severity").unwrap_or_default(),
            file: text("file").or_else(|| text("path")),
            line,
            message: text("message")
                .or_else(|| text("description"))
                .unwrap_or_default(),
            suggestion: text("suggestion"),
        })
    }
}

/// Verdict of a reviewing output
#[must_use]
pub fn parse_review_verdict(text: &str) -> ReviewVerdict {
    decode_review(text).verdict
}

fn scan_verdict(text: &str) -> ReviewVerdict {
    VERDICT_RE
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map_or(ReviewVerdict::Unknown, |m| ReviewVerdict::from(m.as_str()))
}

// ---------------------------------------------------------------------------
// Evaluating
// ---------------------------------------------------------------------------

/// Final evaluation verdict
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", from = "String")]
pub enum FinalVerdict {
    Accept,
    Reject,
    #[default]
    Unknown,
}

impl From<String> for FinalVerdict {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACCEPT" | "ACCEPTED" | "APPROVE" | "APPROVED" => Self::Accept,
            "REJECT" | "REJECTED" => Self::Reject,
            _ => Self::Unknown,
        }
    }
}

impl Display for FinalVerdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accept => "ACCEPT",
            Self::Reject => "REJECT",
            Self::Unknown => "UNKNOWN",
        })
    }
}

/// Decoded evaluating output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationOutput {
    /// 0-10; 0 when absent or unparsable
    pub overall_score: f64,
    pub final_verdict: FinalVerdict,
}

impl Default for EvaluationOutput {
    fn default() -> Self {
        Self {
            overall_score: 0.0,
            final_verdict: FinalVerdict::Unknown,
        }
    }
}

/// Decode an evaluating output; never fails
///
/// Fields are read from `evaluation.*`, or from the top level when there is
/// no `evaluation` object. Numeric strings are accepted as scores.
#[must_use]
pub fn decode_evaluation(text: &str) -> EvaluationOutput {
    let Some(map) = parse_structured(text) else {
        return EvaluationOutput::default();
    };
    let root = Value::Object(map);
    let eval = root
        .get("evaluation")
        .filter(|v| v.is_object())
        .unwrap_or(&root);

    let overall_score = match eval.get("overall_score") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|score| score.is_finite())
    .unwrap_or(0.0);

    let final_verdict = eval
        .get("final_verdict")
        .and_then(Value::as_str)
        .map_or(FinalVerdict::Unknown, |s| FinalVerdict::from(s.to_string()));

    EvaluationOutput {
        overall_score,
        final_verdict,
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

fn fenced_blocks(text: &str) -> Vec<(&str, &str)> {
    FENCE_RE.as_ref().map_or_else(Vec::new, |re| {
        re.captures_iter(text)
            .filter_map(|caps| Some((caps.get(1)?.as_str(), caps.get(2)?.as_str())))
            .collect()
    })
}

/// Candidate text holding the structured object
///
/// The first fenced block wins; otherwise the span from the first `{` to
/// the last `}`; otherwise the trimmed text.
#[must_use]
pub fn extract_structured(text: &str) -> &str {
    if let Some((_, body)) = fenced_blocks(text)
        .into_iter()
        .find(|(lang, _)| matches!(lang.to_ascii_lowercase().as_str(), "" | "json" | "yaml" | "yml"))
    {
        return body.trim();
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text.trim(),
    }
}

/// Parse the structured object of an agent output
///
/// Returns `None` unless the payload decodes (as JSON, then YAML) to an object.
/// When the [`extract_structured`] span does not decode, for example because
/// the prose around the object also holds braces, the first non-empty JSON
/// object that starts at any `{` in the text is used instead.
#[must_use]
pub fn parse_structured(text: &str) -> Option<Map<String, Value>> {
    let candidate = extract_structured(text);
    let value = serde_json::from_str::<Value>(candidate)
        .ok()
        .or_else(|| serde_yaml::from_str::<Value>(candidate).ok());
    match value {
        Some(Value::Object(map)) => Some(map),
        _ => first_embedded_object(text),
    }
}

fn first_embedded_object(text: &str) -> Option<Map<String, Value>> {
    text.match_indices('{').find_map(|(start, _)| {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(map))) if !map.is_empty() => Some(map),
            _ => None,
        }
    })
}

/// Diff text of a coding output
///
/// Prefers a `diff`/`patch` fence, then any fence containing a hunk header,
/// then the whole output.
#[must_use]
pub fn extract_diff(text: &str) -> &str {
    let blocks = fenced_blocks(text);
    blocks
        .iter()
        .find(|(lang, _)| matches!(lang.to_ascii_lowercase().as_str(), "diff" | "patch" | "udiff"))
        .or_else(|| blocks.iter().find(|(_, body)| body.contains("@@")))
        .map_or(text, |(_, body)| *body)
}
