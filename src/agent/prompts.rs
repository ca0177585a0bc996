//! Prompt text for the oracle.
//!
//! The orchestrator never looks inside these strings. Each agent kind gets a
//! system prompt, a task brief and an answer schema; the builders below
//! combine them with whatever evidence the run has gathered.

use super::accumulator::Accumulator;
use super::models::{AgentContext, AgentKind, StepResult};
use super::oracle::truncate_str;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::fmt::Write;

/// Characters of the current result embedded in the evaluation prompt.
pub const EVALUATION_RESULT_CHARS: usize = 1000;
const PREVIOUS_RESULT_CHARS: usize = 1500;
const FILE_CONTENT_CHARS: usize = 6000;
const MAX_CONTEXT_ITEMS: usize = 20;
const COMMIT_MESSAGE_CHARS: usize = 150;

pub const EVALUATOR_SYSTEM_PROMPT: &str = "You judge whether an analysis has gathered enough \
evidence to answer the question. Be strict. Respond with JSON only.";

pub const ROUTER_SYSTEM_PROMPT: &str = "You classify project-management questions and pick the \
agent best suited to answer them. Respond with JSON only.";

pub fn system_prompt(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::TaskSuggestion => {
            "You are a senior software engineer. Study the repository and propose concrete, \
             actionable tasks. Respond with JSON only."
        }
        AgentKind::ProgressAnalysis => {
            "You are a delivery lead. Estimate project progress from commits, tasks and code. \
             Respond with JSON only."
        }
        AgentKind::TaskCompletion => {
            "You are a code reviewer. Decide from the code whether a task has really been \
             implemented. Respond with JSON only."
        }
        AgentKind::GeneralQa => {
            "You answer questions about a software project using its statistics, commits and \
             code. Decline politely when a question is unrelated. Respond with JSON only."
        }
        AgentKind::TaskAssignment => {
            "You match tasks to team members based on skills and the code a task touches. \
             Respond with JSON only."
        }
    }
}

fn task_brief(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::TaskSuggestion => {
            "Suggest the next tasks for this project. Prefer security and refactoring work \
             backed by evidence in the code over generic advice."
        }
        AgentKind::ProgressAnalysis => {
            "Estimate how far along the project is, how activity is trending and whether the \
             due date is at risk."
        }
        AgentKind::TaskCompletion => {
            "Decide whether the task below is complete. Locate where it would be implemented \
             and check the code there."
        }
        AgentKind::GeneralQa => "Answer the user's question about this project.",
        AgentKind::TaskAssignment => {
            "Recommend who should take the task below. Work out which stack and experience it \
             needs from the code it touches."
        }
    }
}

fn answer_schema(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::TaskSuggestion => {
            r#"[{"title": "...", "description": "...", "category": "feature|refactor|security|performance|maintenance", "priority": "High|Medium|Low", "estimatedHours": 4, "reason": "..."}]"#
        }
        AgentKind::ProgressAnalysis => {
            r#"{"currentProgress": 0-100, "activityTrend": "increasing|stable|decreasing", "estimatedCompletionDate": "YYYY-MM-DD or null", "delayRisk": "Low|Medium|High", "insights": ["..."], "recommendations": ["..."]}"#
        }
        AgentKind::TaskCompletion => {
            r#"{"isCompleted": true, "completionPercentage": 0-100, "confidence": "high|medium|low", "reason": "...", "evidence": ["..."], "recommendation": "...", "locationFound": "path or null", "implementationStatus": "complete|partial|missing"}"#
        }
        AgentKind::GeneralQa => {
            r#"{"can_answer": true, "message": "...", "details": {"used_statistics": ["..."], "source": "...", "examples": ["..."]}, "sources": ["..."]}"#
        }
        AgentKind::TaskAssignment => {
            r#"{"recommendedUserId": "...", "recommendedUserName": "...", "confidence": "high|medium|low", "reason": "...", "requiredSkills": ["..."], "alternatives": [{"userId": "...", "reason": "..."}]}"#
        }
    }
}

fn compact(value: &Value, max_chars: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate_str(&text, max_chars).to_string()
}

fn render_list(out: &mut String, title: &str, items: &[Value], fields: &[&str]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n## {} ({})", title, items.len());
    for item in items.iter().take(MAX_CONTEXT_ITEMS) {
        let parts: Vec<String> = fields
            .iter()
            .filter_map(|field| {
                item.get(*field)
                    .filter(|v| !v.is_null())
                    .map(|v| format!("{}: {}", field, compact(v, COMMIT_MESSAGE_CHARS)))
            })
            .collect();
        if parts.is_empty() {
            let _ = writeln!(out, "- {}", compact(item, COMMIT_MESSAGE_CHARS));
        } else {
            let _ = writeln!(out, "- {}", parts.join(" | "));
        }
    }
}

/// Total commits and how many fall in the seven days before `now`.
pub(crate) fn recent_commit_stats(commits: &[Value], now: DateTime<Utc>) -> (usize, usize) {
    let cutoff = now - Duration::days(7);
    let recent = commits
        .iter()
        .filter_map(|c| c.get("date").and_then(Value::as_str))
        .filter_map(|d| DateTime::parse_from_rfc3339(d).ok())
        .filter(|d| d.with_timezone(&Utc) >= cutoff)
        .count();
    (commits.len(), recent)
}

fn render_context(out: &mut String, kind: AgentKind, ctx: &AgentContext) {
    if ctx.has_repo() {
        let _ = writeln!(out, "Repository: {}", ctx.github_repo.trim());
    }
    if let Some(desc) = ctx.text("projectDescription") {
        let _ = writeln!(out, "Project description: {}", truncate_str(desc, 500));
    }
    for (key, label) in [("projectStartDate", "Start date"), ("projectDueDate", "Due date")] {
        if let Some(date) = ctx.text(key) {
            let _ = writeln!(out, "{}: {}", label, date);
        }
    }

    let commits = ctx.list("commits");
    if kind == AgentKind::ProgressAnalysis && !commits.is_empty() {
        let (total, recent) = recent_commit_stats(commits, Utc::now());
        let _ = writeln!(out, "Commits: {} total, {} in the last 7 days", total, recent);
    }
    render_list(out, "Recent commits", commits, &["sha", "message", "date", "author"]);
    render_list(out, "Open issues", ctx.list("issues"), &["title", "state", "labels"]);
    render_list(
        out,
        "Current tasks",
        ctx.list("currentTasks"),
        &["title", "status", "dueDate", "assignedUserId"],
    );

    match kind {
        AgentKind::TaskCompletion => {
            if let Some(task) = ctx.extra.get("task") {
                let _ = writeln!(out, "\n## Task under review\n{}", compact(task, 1000));
            }
        }
        AgentKind::TaskAssignment => {
            if let Some(title) = ctx.text("taskTitle") {
                let _ = writeln!(out, "\n## Task\nTitle: {}", title);
            }
            if let Some(desc) = ctx.text("taskDescription") {
                let _ = writeln!(out, "Description: {}", truncate_str(desc, 1000));
            }
            render_list(
                out,
                "Team members",
                ctx.list("projectMembersWithTags"),
                &["userId", "name", "tags"],
            );
        }
        _ => {}
    }
}

fn render_evidence(out: &mut String, acc: &Accumulator) {
    if !acc.fetched_files().is_empty() {
        let _ = writeln!(out, "\n## Files read so far");
        for file in acc.fetched_files() {
            let note = if file.truncated { " (truncated)" } else { "" };
            let _ = writeln!(
                out,
                "\n### {}{}\n```\n{}\n```",
                file.path,
                note,
                truncate_str(&file.content, FILE_CONTENT_CHARS)
            );
        }
    }

    if !acc.commit_details().is_empty() {
        let _ = writeln!(out, "\n## Commit details");
        for commit in acc.commit_details() {
            let _ = writeln!(
                out,
                "\n### {} {}",
                truncate_str(&commit.sha, 10),
                truncate_str(commit.message.lines().next().unwrap_or(""), COMMIT_MESSAGE_CHARS)
            );
            for file in &commit.files {
                let _ = writeln!(
                    out,
                    "- {} ({}, +{} -{})",
                    file.filename, file.status, file.additions, file.deletions
                );
                if let Some(patch) = &file.patch {
                    let _ = writeln!(out, "```diff\n{}\n```", patch);
                }
            }
        }
    } else if !acc.referenced_commits().is_empty() {
        let _ = writeln!(
            out,
            "\nCommits flagged for analysis: {}",
            acc.referenced_commits().join(", ")
        );
    }
}

fn render_question(out: &mut String, user_message: Option<&str>) {
    if let Some(message) = user_message.filter(|m| !m.trim().is_empty()) {
        let _ = writeln!(out, "\n## User question\n\"{}\"", message.trim());
    }
}

fn render_schema(out: &mut String, kind: AgentKind) {
    let _ = writeln!(
        out,
        "\nRespond with JSON in exactly this shape and nothing else:\n{}",
        answer_schema(kind)
    );
}

/// First prompt of a run.
pub fn initial_prompt(
    kind: AgentKind,
    ctx: &AgentContext,
    user_message: Option<&str>,
    acc: &Accumulator,
    step: usize,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} (analysis step {})\n", task_brief(kind), step);
    render_context(&mut out, kind, ctx);
    render_question(&mut out, user_message);
    render_evidence(&mut out, acc);
    render_schema(&mut out, kind);
    out
}

/// Prompt for every step after the first.
pub fn followup_prompt(
    kind: AgentKind,
    ctx: &AgentContext,
    previous: &StepResult,
    user_message: Option<&str>,
    acc: &Accumulator,
    step: usize,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} This is analysis step {}. Refine the previous answer using the new evidence.\n",
        task_brief(kind),
        step
    );
    render_context(&mut out, kind, ctx);
    render_question(&mut out, user_message);
    let _ = writeln!(
        out,
        "\n## Previous answer (step {})\n{}",
        previous.step_index,
        previous.preview(PREVIOUS_RESULT_CHARS)
    );
    render_evidence(&mut out, acc);
    render_schema(&mut out, kind);
    out
}

/// Meta-evaluation instruction for the sufficiency check.
pub fn evaluation_prompt(
    current: &StepResult,
    kind: AgentKind,
    step: usize,
    max_steps: usize,
) -> String {
    format!(
        r#"Decide whether the analysis below has enough information to answer with confidence.

## Step: {step}/{max_steps}
## Agent: {kind}

## Current result
{result}

## Criteria
1. Is there enough information to answer the question?
2. How reliable is the current result?
3. Is more evidence needed, and if so which files or commits?

Respond with JSON only:
{{
  "is_sufficient": true or false,
  "confidence": "high|medium|low",
  "needs_more_info": true or false,
  "next_search_strategy": "what to look at next",
  "files_to_read": ["path/one", "path/two"],
  "commits_to_analyze": ["sha1", "sha2"],
  "reason": "why"
}}

Rules:
- is_sufficient is true only when the information is sufficient and confidence is high
- needs_more_info is true when information is missing or confidence is low
- files_to_read holds repository paths, at most 5
- commits_to_analyze holds commit SHAs, at most 5
- at step {max_steps} is_sufficient must be true"#,
        step = step,
        max_steps = max_steps,
        kind = kind,
        result = current.preview(EVALUATION_RESULT_CHARS),
    )
}

/// Intent classification prompt for the router.
pub fn intent_prompt(user_message: &str, history: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Pick the agent that should answer the user's message.\n");
    let _ = writeln!(out, "## Agents");
    for kind in AgentKind::ALL {
        let _ = writeln!(out, "- {}: {}", kind.as_str(), task_brief(kind));
    }
    if !history.is_empty() {
        let _ = writeln!(out, "\n## Recent conversation");
        let skip = history.len().saturating_sub(5);
        for turn in &history[skip..] {
            let _ = writeln!(out, "- {}", truncate_str(turn, 200));
        }
    }
    let _ = writeln!(out, "\n## Message\n\"{}\"", user_message.trim());
    let _ = writeln!(
        out,
        "\nRespond with JSON only:\n{}",
        r#"{"agent_type": "<one of the agents above>", "confidence": "high|medium|low", "reason": "...", "extracted_info": {}}"#
    );
    out
}
