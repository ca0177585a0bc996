use crate::error::AgentError;
use crate::github::{RepoHandle, RepoIdentity};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Files and commits a single verdict may request.
pub const MAX_VERDICT_ITEMS: usize = 5;

/// Analysis routines a question can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    #[serde(rename = "task_suggestion_agent")]
    TaskSuggestion,
    #[serde(rename = "progress_analysis_agent")]
    ProgressAnalysis,
    #[serde(rename = "task_completion_agent")]
    TaskCompletion,
    #[serde(rename = "general_qa_agent")]
    GeneralQa,
    #[serde(rename = "task_assignment_agent")]
    TaskAssignment,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::TaskSuggestion,
        AgentKind::ProgressAnalysis,
        AgentKind::TaskCompletion,
        AgentKind::GeneralQa,
        AgentKind::TaskAssignment,
    ];

    /// Wire name, e.g. `progress_analysis_agent`
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::TaskSuggestion => "task_suggestion_agent",
            AgentKind::ProgressAnalysis => "progress_analysis_agent",
            AgentKind::TaskCompletion => "task_completion_agent",
            AgentKind::GeneralQa => "general_qa_agent",
            AgentKind::TaskAssignment => "task_assignment_agent",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgentKind::TaskSuggestion => "task suggestion",
            AgentKind::ProgressAnalysis => "progress analysis",
            AgentKind::TaskCompletion => "task completion check",
            AgentKind::GeneralQa => "general Q&A",
            AgentKind::TaskAssignment => "task assignment",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    /// Accepts wire names, short names (`general_qa`) and dashed forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let short = normalized.strip_suffix("_agent").unwrap_or(&normalized);
        match short {
            "task_suggestion" => Ok(AgentKind::TaskSuggestion),
            "progress_analysis" | "progress" => Ok(AgentKind::ProgressAnalysis),
            "task_completion" => Ok(AgentKind::TaskCompletion),
            "general_qa" | "qa" => Ok(AgentKind::GeneralQa),
            "task_assignment" => Ok(AgentKind::TaskAssignment),
            _ => Err(format!("unknown agent kind '{}'", s.trim())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    #[default]
    Low,
}

impl Confidence {
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Confidence::High),
            "medium" | "med" => Some(Confidence::Medium),
            "low" => Some(Confidence::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

/// Unknown or missing confidence reads as low.
fn lenient_confidence<'de, D>(deserializer: D) -> Result<Confidence, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_str)
        .and_then(Confidence::parse_lenient)
        .unwrap_or_default())
}

/// Keep only non-empty string entries; `null` reads as empty.
fn lenient_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    })
}

/// One step's structured answer, tagged with its 1-based position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_index: usize,
    pub record: Map<String, Value>,
}

impl StepResult {
    pub fn new(step_index: usize, record: Map<String, Value>) -> Self {
        Self { step_index, record }
    }

    /// Pretty JSON of the record, cut to `max_chars` characters.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = serde_json::to_string_pretty(&self.record).unwrap_or_default();
        crate::agent::oracle::truncate_str(&text, max_chars).to_string()
    }
}

/// The oracle's judgement of whether a step's answer is good enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SufficiencyVerdict {
    #[serde(alias = "is_sufficient", default)]
    pub is_sufficient: bool,
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence: Confidence,
    #[serde(alias = "needs_more_info", default)]
    pub needs_more_info: bool,
    #[serde(
        alias = "files_to_read",
        alias = "filesToRead",
        alias = "files_to_fetch",
        default,
        deserialize_with = "lenient_string_list"
    )]
    pub files_to_fetch: Vec<String>,
    #[serde(
        alias = "commits_to_analyze",
        default,
        deserialize_with = "lenient_string_list"
    )]
    pub commits_to_analyze: Vec<String>,
    #[serde(
        alias = "next_search_strategy",
        default,
        deserialize_with = "lenient_text"
    )]
    pub next_search_strategy: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub reason: String,
}

impl SufficiencyVerdict {
    /// Verdict used when the oracle's judgement is unavailable.
    pub fn conservative(step: usize, max_steps: usize, reason: impl Into<String>) -> Self {
        let is_sufficient = step >= max_steps;
        Self {
            is_sufficient,
            confidence: Confidence::Low,
            needs_more_info: !is_sufficient,
            files_to_fetch: Vec::new(),
            commits_to_analyze: Vec::new(),
            next_search_strategy: String::new(),
            reason: reason.into(),
        }
    }

    /// Cap the requested lists and drop repeats.
    pub fn normalized(mut self) -> Self {
        for list in [&mut self.files_to_fetch, &mut self.commits_to_analyze] {
            let mut seen = std::collections::HashSet::new();
            list.retain(|item| seen.insert(item.clone()));
            list.truncate(MAX_VERDICT_ITEMS);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Evaluator was satisfied or the step budget ran out
    Done,
    /// A later step failed; the last good result is returned
    GracefulStop,
    /// The first step produced nothing usable
    Failed,
}

/// Final product of one orchestration run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResult {
    pub run_id: String,
    pub agent_kind: AgentKind,
    pub outcome: Outcome,
    pub last_step_result: Option<StepResult>,
    pub step_count: usize,
    pub step_history: Vec<StepResult>,
    pub confidence: Confidence,
    pub progress_log: Vec<String>,
    pub fetched_paths: Vec<String>,
    pub referenced_commits: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Caller-supplied context for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    #[serde(alias = "github_repo", default)]
    pub github_repo: String,
    #[serde(alias = "github_token", default, skip_serializing)]
    pub github_token: Option<String>,
    #[serde(alias = "ref", alias = "git_ref", default)]
    pub git_ref: Option<String>,
    /// Tasks, commits, team members and anything else the prompts may use
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentContext {
    pub fn new(github_repo: impl Into<String>) -> Self {
        Self {
            github_repo: github_repo.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.github_token = token;
        self
    }

    pub fn with_ref(mut self, git_ref: Option<String>) -> Self {
        self.git_ref = git_ref;
        self
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.extra.insert(key.to_string(), value);
    }

    pub fn has_repo(&self) -> bool {
        !self.github_repo.trim().is_empty()
    }

    /// Resolve the repository this run reads from.
    pub fn repo_handle(&self) -> Result<RepoHandle, AgentError> {
        let identity = RepoIdentity::parse(&self.github_repo)?;
        Ok(RepoHandle::new(identity)
            .with_token(self.github_token.clone())
            .with_ref(self.git_ref.clone()))
    }

    /// Array-valued side data, empty when absent.
    pub fn list(&self, key: &str) -> &[Value] {
        self.extra
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}
