//! The bounded evidence-gathering loop.
//!
//! One run alternates oracle steps and sufficiency checks, fetching more
//! evidence between steps until the evaluator is satisfied, the step budget
//! is spent, or a step fails. `run` always returns a result; failures show
//! up as `Outcome::GracefulStop` / `Outcome::Failed` and in the progress log.

use super::accumulator::Accumulator;
use super::dispatch::{AgentStrategy, StrategyTable};
use super::evaluator::SufficiencyEvaluator;
use super::models::{
    AgentContext, AgentKind, Confidence, OrchestrationResult, Outcome, StepResult,
    SufficiencyVerdict,
};
use super::oracle::Oracle;
use super::parse::parse_structured_record;
use crate::config::OrchestratorConfig;
use crate::error::AgentError;
use crate::github::{ContentSource, EvidenceFetcher, FetchLimits};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub struct Orchestrator {
    oracle: Arc<dyn Oracle>,
    source: Arc<dyn ContentSource>,
    strategies: StrategyTable,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        source: Arc<dyn ContentSource>,
        strategies: StrategyTable,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            oracle,
            source,
            strategies,
            config,
        }
    }

    /// Run one analysis for `kind` and return its final result.
    pub async fn run(
        &self,
        kind: AgentKind,
        ctx: &AgentContext,
        user_message: Option<&str>,
    ) -> OrchestrationResult {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("orchestration", run_id = %run_id, agent = %kind);
        self.run_inner(run_id, kind, ctx, user_message)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: String,
        kind: AgentKind,
        ctx: &AgentContext,
        user_message: Option<&str>,
    ) -> OrchestrationResult {
        let mut acc = Accumulator::new();
        let max_steps = self.config.max_steps;

        let Some(strategy) = self.strategies.get(kind) else {
            let message = format!("no strategy registered for {}", kind);
            acc.notice(message.clone());
            return finish(run_id, kind, acc, Outcome::Failed, Confidence::Low, Some(message));
        };

        acc.notice(format!(
            "starting {} (up to {} steps)",
            kind.label(),
            max_steps
        ));
        let fetcher = self.fetcher_for(ctx, &mut acc);
        let evaluator =
            SufficiencyEvaluator::new(self.oracle.as_ref(), max_steps, self.config.oracle_timeout);

        let mut confidence = Confidence::Low;
        let mut step = 1;
        let (outcome, error) = loop {
            acc.notice(format!("step {}/{} started", step, max_steps));

            let prompt = match acc.last_step() {
                None => strategy
                    .dispatcher
                    .initial_prompt(ctx, user_message, &acc, step),
                Some(previous) => {
                    strategy
                        .dispatcher
                        .followup_prompt(ctx, previous, user_message, &acc, step)
                }
            };

            let record = match self.step_record(&prompt, &strategy.system_prompt).await {
                Ok(record) => record,
                Err(err) => {
                    let err = format!("{:#}", err);
                    if acc.step_history().is_empty() {
                        acc.notice(format!("step {} failed with no earlier result: {}", step, err));
                        confidence = Confidence::Low;
                        break (Outcome::Failed, Some(err));
                    }
                    acc.notice(format!(
                        "step {} failed: {}; keeping the result of step {}",
                        step,
                        err,
                        step - 1
                    ));
                    break (Outcome::GracefulStop, None);
                }
            };

            let current = StepResult::new(step, record);
            acc.push_step(current.clone());
            acc.notice(format!("step {} completed", step));

            let verdict = evaluator.evaluate(&current, kind, step).await;
            confidence = verdict.confidence;
            acc.notice(format!(
                "evaluation: sufficient={} confidence={} needs_more_info={}{}",
                verdict.is_sufficient,
                verdict.confidence.as_str(),
                verdict.needs_more_info,
                if verdict.reason.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", verdict.reason)
                }
            ));

            if verdict.is_sufficient || step >= max_steps {
                break (Outcome::Done, None);
            }

            if verdict.needs_more_info {
                let new_commits = acc.reference_commits(&verdict.commits_to_analyze);
                match &fetcher {
                    Some(fetcher) => {
                        self.gather(fetcher, strategy, &verdict, &new_commits, &mut acc)
                            .await
                    }
                    None if !new_commits.is_empty() => acc.notice(format!(
                        "noted {} commit(s) for analysis; no repository to fetch them from",
                        new_commits.len()
                    )),
                    None => {}
                }
            }

            step += 1;
        };

        acc.notice(match outcome {
            Outcome::Done => format!(
                "finished after {} step(s) with {} confidence",
                acc.step_history().len(),
                confidence.as_str()
            ),
            Outcome::GracefulStop => format!(
                "stopped early after {} step(s)",
                acc.step_history().len()
            ),
            Outcome::Failed => "analysis failed".to_string(),
        });
        finish(run_id, kind, acc, outcome, confidence, error)
    }

    fn fetcher_for(&self, ctx: &AgentContext, acc: &mut Accumulator) -> Option<EvidenceFetcher> {
        if !ctx.has_repo() {
            acc.notice("no repository in context; evidence fetching disabled");
            return None;
        }
        match ctx.repo_handle() {
            Ok(handle) => Some(EvidenceFetcher::new(
                self.source.clone(),
                handle,
                FetchLimits::from(&self.config),
            )),
            Err(err) => {
                acc.notice(format!("evidence fetching disabled: {}", err));
                None
            }
        }
    }

    async fn step_record(&self, prompt: &str, system: &str) -> anyhow::Result<Map<String, Value>> {
        let limit = self.config.oracle_timeout;
        let text = tokio::time::timeout(limit, self.oracle.complete(prompt, system))
            .await
            .map_err(|_| {
                AgentError::transport(format!("oracle timed out after {}s", limit.as_secs_f32()))
            })??;
        Ok(parse_structured_record(&text)?)
    }

    /// Fetch the evidence a verdict asks for and merge it into `acc`.
    async fn gather(
        &self,
        fetcher: &EvidenceFetcher,
        strategy: &AgentStrategy,
        verdict: &SufficiencyVerdict,
        new_commits: &[String],
        acc: &mut Accumulator,
    ) {
        let requested = if verdict.files_to_fetch.is_empty() {
            self.fallback_paths(fetcher, strategy, acc).await
        } else {
            verdict.files_to_fetch.clone()
        };

        let paths = pending_paths(&requested, acc);
        if !paths.is_empty() {
            acc.notice(format!("fetching {} file(s): {}", paths.len(), paths.join(", ")));
            let batch = fetcher.fetch_files(&paths).await;
            let added = acc.merge_fetch_results(&batch.results);
            for result in &batch.results {
                if let Some(err) = &result.error {
                    acc.notice(format!("could not read {}: {}", result.path, err));
                }
            }
            if !batch.dropped.is_empty() {
                acc.notice(format!(
                    "skipped {} path(s) over the per-batch limit",
                    batch.dropped.len()
                ));
            }
            acc.notice(format!("read {} of {} file(s)", added, paths.len()));
            self.check_quota(batch.quota_remaining, acc);
        } else if !requested.is_empty() {
            acc.notice("requested files were already read");
        }

        let pending: Vec<String> = new_commits
            .iter()
            .filter(|sha| !acc.has_commit_detail(sha))
            .cloned()
            .collect();
        if !pending.is_empty() {
            acc.notice(format!("fetching {} commit(s)", pending.len()));
            let batch = fetcher.fetch_commits(&pending).await;
            for commit in batch.results {
                match (commit.detail, commit.error) {
                    (Some(detail), _) => acc.add_commit_detail(detail),
                    (None, err) => acc.notice(format!(
                        "could not read commit {}: {}",
                        commit.sha,
                        err.unwrap_or_default()
                    )),
                }
            }
            self.check_quota(batch.quota_remaining, acc);
        }
    }

    /// Heuristic evidence for a verdict that wants more but names nothing.
    async fn fallback_paths(
        &self,
        fetcher: &EvidenceFetcher,
        strategy: &AgentStrategy,
        acc: &mut Accumulator,
    ) -> Vec<String> {
        let heuristics = &strategy.heuristics;
        if heuristics.is_empty() {
            return Vec::new();
        }
        acc.notice(format!("no files named; using fallback evidence for {}", strategy.kind));

        let mut paths = heuristics.files.clone();
        for dir in &heuristics.scan_dirs {
            match fetcher
                .list_directory(dir, self.config.directory_depth)
                .await
            {
                Ok(listing) => {
                    acc.notice(format!(
                        "listed {} source file(s) under {}",
                        listing.files.len(),
                        dir
                    ));
                    for skipped in &listing.skipped {
                        acc.notice(format!("skipped unreadable directory {}", skipped));
                    }
                    self.check_quota(listing.quota_remaining, acc);
                    paths.extend(listing.files);
                }
                Err(err) => acc.notice(format!("could not list {}: {:#}", dir, err)),
            }
        }
        paths
    }

    fn check_quota(&self, remaining: Option<u32>, acc: &mut Accumulator) {
        if let Some(remaining) = remaining {
            if remaining < self.config.quota_low_water {
                acc.notice(format!(
                    "GitHub rate limit is low: {} request(s) remaining",
                    remaining
                ));
            }
        }
    }
}

/// Requested paths minus blanks, repeats and files already read.
fn pending_paths(requested: &[String], acc: &Accumulator) -> Vec<String> {
    let mut seen = HashSet::new();
    requested
        .iter()
        .map(|p| p.trim().trim_start_matches('/'))
        .filter(|p| !p.is_empty() && !acc.has_file(p))
        .filter(|p| seen.insert(p.to_string()))
        .map(str::to_string)
        .collect()
}

fn finish(
    run_id: String,
    kind: AgentKind,
    acc: Accumulator,
    outcome: Outcome,
    confidence: Confidence,
    error: Option<String>,
) -> OrchestrationResult {
    let (step_history, progress_log, fetched_paths, referenced_commits) = acc.into_parts();
    OrchestrationResult {
        run_id,
        agent_kind: kind,
        outcome,
        last_step_result: step_history.last().cloned(),
        step_count: step_history.len(),
        step_history,
        confidence,
        progress_log,
        fetched_paths,
        referenced_commits,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::dispatch::{HeuristicFiles, PromptDispatcher};
    use crate::github::EntryKind;
    use crate::test_support::{
        insufficient_verdict, sufficient_verdict, ScriptedOracle, StubEntry, StubSource,
    };
    use std::collections::HashMap;
    use std::time::Duration;

    const REPO: &str = "https://github.com/acme/widgets";

    fn config(max_steps: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            max_steps,
            oracle_timeout: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator(
        oracle: &Arc<ScriptedOracle>,
        source: &Arc<StubSource>,
        max_steps: usize,
    ) -> Orchestrator {
        Orchestrator::new(
            oracle.clone(),
            source.clone(),
            StrategyTable::default(),
            config(max_steps),
        )
    }

    fn step_json(n: usize) -> String {
        format!(r#"{{"answer": "step {}"}}"#, n)
    }

    fn log_contains(result: &OrchestrationResult, needle: &str) -> bool {
        result.progress_log.iter().any(|line| line.contains(needle))
    }

    #[tokio::test]
    async fn test_immediate_sufficiency_runs_one_step() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .step(&step_json(1))
                .verdict(&sufficient_verdict("high")),
        );
        let source = Arc::new(StubSource::new());
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), Some("what is this?"))
            .await;

        assert_eq!(result.outcome, Outcome::Done);
        assert_eq!(result.step_count, 1);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.last_step_result.unwrap().record["answer"], "step 1");
        assert!(source.calls().is_empty());
        assert!(result.error.is_none());
        assert!(!result.run_id.is_empty());
    }

    #[tokio::test]
    async fn test_never_sufficient_stops_at_max_steps() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .always_verdict(
                    r#"{"is_sufficient": false, "confidence": "medium", "needs_more_info": false}"#,
                ),
        );
        let source = Arc::new(StubSource::new());
        let result = orchestrator(&oracle, &source, 4)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.outcome, Outcome::Done);
        assert_eq!(result.step_count, 4);
        assert_eq!(result.confidence, Confidence::Medium);
        assert_eq!(oracle.evaluator_calls(), 4);
        assert_eq!(oracle.step_prompts().len(), 4);
    }

    #[tokio::test]
    async fn test_fetching_every_step_still_stops_at_max_steps() {
        let wants = |path: &str| {
            serde_json::json!({
                "is_sufficient": false,
                "confidence": "medium",
                "needs_more_info": true,
                "files_to_read": [path],
            })
            .to_string()
        };
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&wants("src/one.rs"))
                .verdict(&wants("src/two.rs"))
                .verdict(&wants("src/three.rs"))
                .verdict(&wants("src/four.rs")),
        );
        let source = Arc::new(
            StubSource::new()
                .file("src/one.rs", "fn one() {}")
                .file("src/two.rs", "fn two() {}")
                .file("src/three.rs", "fn three() {}")
                .file("src/four.rs", "fn four() {}"),
        );
        let result = orchestrator(&oracle, &source, 4)
            .run(AgentKind::TaskCompletion, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.outcome, Outcome::Done);
        assert_eq!(result.step_count, 4);
        assert_eq!(result.confidence, Confidence::Medium);
        assert_eq!(oracle.evaluator_calls(), 4);
        assert_eq!(source.calls(), vec!["src/one.rs", "src/two.rs", "src/three.rs"]);
        assert!(!result.fetched_paths.contains(&"src/four.rs".to_string()));
    }

    #[tokio::test]
    async fn test_repeated_request_is_fetched_once_before_max_steps() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .always_verdict(&insufficient_verdict(&["src/x.rs"], &[])),
        );
        let source = Arc::new(StubSource::new().file("src/x.rs", "fn x() {}"));
        let result = orchestrator(&oracle, &source, 3)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.outcome, Outcome::Done);
        assert_eq!(result.step_count, 3);
        assert_eq!(result.confidence, Confidence::Low);
        assert_eq!(source.calls(), vec!["src/x.rs"]);
    }

    #[tokio::test]
    async fn test_step_history_is_indexed_in_order() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .step(&step_json(1))
                .step(&step_json(2))
                .step(&step_json(3))
                .verdict(&insufficient_verdict(&[], &[]))
                .verdict(&insufficient_verdict(&[], &[]))
                .verdict(&sufficient_verdict("medium")),
        );
        let source = Arc::new(StubSource::new().file("README.md", "# Widgets"));
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.step_count, 3);
        for (i, step) in result.step_history.iter().enumerate() {
            assert_eq!(step.step_index, i + 1);
            assert_eq!(step.record["answer"], format!("step {}", i + 1));
        }
    }

    #[tokio::test]
    async fn test_failure_at_step_three_keeps_step_two() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .step(&step_json(1))
                .step(&step_json(2))
                .step_fails("connection reset")
                .always_verdict(&insufficient_verdict(&[], &[])),
        );
        let source = Arc::new(StubSource::new());
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::ProgressAnalysis, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.outcome, Outcome::GracefulStop);
        assert_eq!(result.step_count, 2);
        let last = result.last_step_result.as_ref().unwrap();
        assert_eq!(last.step_index, 2);
        assert_eq!(last.record["answer"], "step 2");
        assert!(result.error.is_none());
        assert!(log_contains(&result, "connection reset"));
    }

    #[tokio::test]
    async fn test_malformed_later_step_is_graceful() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .step(&step_json(1))
                .step("Sorry, I cannot produce JSON right now.")
                .always_verdict(&insufficient_verdict(&[], &[])),
        );
        let source = Arc::new(StubSource::new());
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.outcome, Outcome::GracefulStop);
        assert_eq!(result.step_count, 1);
    }

    #[tokio::test]
    async fn test_first_step_failure_is_fatal() {
        let oracle = Arc::new(ScriptedOracle::new().step("no json here"));
        let source = Arc::new(StubSource::new());
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.step_count, 0);
        assert!(result.last_step_result.is_none());
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.error.unwrap().contains("malformed"));
        assert_eq!(oracle.evaluator_calls(), 0);
    }

    #[tokio::test]
    async fn test_oracle_timeout_is_a_step_failure() {
        let oracle = Arc::new(ScriptedOracle::new().step_hangs());
        let source = Arc::new(StubSource::new());
        let orchestrator = Orchestrator::new(
            oracle.clone(),
            source,
            StrategyTable::default(),
            OrchestratorConfig {
                oracle_timeout: Duration::from_millis(30),
                ..OrchestratorConfig::default()
            },
        );
        let result = orchestrator
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_requested_files_are_fetched_once() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&["src/a.rs", "src/b.rs", "src/a.rs"], &[]))
                .verdict(&insufficient_verdict(&["src/a.rs", "/src/b.rs", "src/c.rs"], &[]))
                .verdict(&sufficient_verdict("high")),
        );
        let source = Arc::new(
            StubSource::new()
                .file("src/a.rs", "fn a() {}")
                .file("src/b.rs", "fn b() {}")
                .file("src/c.rs", "fn c() {}"),
        );
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::TaskCompletion, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.fetched_paths, vec!["src/a.rs", "src/b.rs", "src/c.rs"]);
        let mut calls = source.calls();
        calls.sort();
        assert_eq!(calls, vec!["src/a.rs", "src/b.rs", "src/c.rs"]);
        let unique: HashSet<_> = result.fetched_paths.iter().collect();
        assert_eq!(unique.len(), result.fetched_paths.len());
    }

    #[tokio::test]
    async fn test_fetched_evidence_reaches_followup_prompt() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&["src/auth.rs"], &[]))
                .verdict(&sufficient_verdict("high")),
        );
        let source = Arc::new(StubSource::new().file("src/auth.rs", "fn login_with_oauth() {}"));
        orchestrator(&oracle, &source, 10)
            .run(AgentKind::TaskCompletion, &AgentContext::new(REPO), None)
            .await;

        let prompts = oracle.step_prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("login_with_oauth"));
        assert!(prompts[1].contains("login_with_oauth"));
        assert!(prompts[1].contains("Previous answer (step 1)"));
    }

    #[tokio::test]
    async fn test_fetch_failures_are_isolated_and_logged() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&["A.md", "B", "C.md"], &[]))
                .verdict(&sufficient_verdict("medium")),
        );
        let source = Arc::new(
            StubSource::new()
                .file("A.md", "alpha")
                .entry("B", StubEntry::Other("submodule".to_string()))
                .file("C.md", "gamma"),
        );
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.outcome, Outcome::Done);
        assert_eq!(result.fetched_paths, vec!["A.md", "C.md"]);
        assert!(log_contains(&result, "could not read B"));
        assert!(log_contains(&result, "read 2 of 3 file(s)"));
    }

    #[tokio::test]
    async fn test_empty_request_uses_fallback_files() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&[], &[]))
                .verdict(&sufficient_verdict("high")),
        );
        let source = Arc::new(StubSource::new().file("README.md", "# Widgets"));
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.fetched_paths, vec!["README.md"]);
        assert!(log_contains(&result, "fallback evidence"));
    }

    #[tokio::test]
    async fn test_fallback_scan_lists_source_directory() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&[], &[]))
                .verdict(&sufficient_verdict("high")),
        );
        let source = Arc::new(
            StubSource::new()
                .dir(
                    "src",
                    &[
                        ("src/main.rs", EntryKind::File),
                        ("src/notes.txt", EntryKind::File),
                        ("src/api", EntryKind::Dir),
                    ],
                )
                .dir("src/api", &[("src/api/routes.rs", EntryKind::File)])
                .file("src/main.rs", "fn main() {}")
                .file("src/api/routes.rs", "pub fn routes() {}"),
        );
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::TaskCompletion, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.fetched_paths, vec!["src/main.rs", "src/api/routes.rs"]);
        assert!(log_contains(&result, "listed 2 source file(s) under src"));
    }

    #[tokio::test]
    async fn test_configured_fallback_overrides_defaults() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&[], &[]))
                .verdict(&sufficient_verdict("high")),
        );
        let source = Arc::new(StubSource::new().file("docs/FAQ.md", "Q&A"));
        let mut overrides = HashMap::new();
        overrides.insert(AgentKind::GeneralQa, HeuristicFiles::new(&["docs/FAQ.md"], &[]));
        let orchestrator = Orchestrator::new(
            oracle.clone(),
            source.clone(),
            StrategyTable::default().with_overrides(&overrides),
            config(10),
        );
        let result = orchestrator
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;
        assert_eq!(result.fetched_paths, vec!["docs/FAQ.md"]);
        assert_eq!(source.calls(), vec!["docs/FAQ.md"]);
    }

    #[tokio::test]
    async fn test_commits_are_referenced_and_detailed() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&["README.md"], &["abc", "def"]))
                .verdict(&insufficient_verdict(&["README.md"], &["abc"]))
                .verdict(&sufficient_verdict("high")),
        );
        let source = Arc::new(
            StubSource::new()
                .file("README.md", "# Widgets")
                .commit("abc", "Add OAuth login", &[("src/auth.rs", "+fn login() {}")]),
        );
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::TaskCompletion, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.referenced_commits, vec!["abc", "def"]);
        assert!(log_contains(&result, "could not read commit def"));
        let commit_calls = source
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("commit:"))
            .count();
        assert_eq!(commit_calls, 2);
        assert!(oracle.step_prompts()[1].contains("Add OAuth login"));
    }

    #[tokio::test]
    async fn test_low_quota_is_logged() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&["README.md"], &[]))
                .verdict(&sufficient_verdict("high")),
        );
        let source = Arc::new(
            StubSource::new()
                .file("README.md", "# Widgets")
                .with_quota_sequence(&[42]),
        );
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;
        assert!(log_contains(&result, "42 request(s) remaining"));
    }

    #[tokio::test]
    async fn test_low_quota_on_refused_fetch_is_logged() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&["src/a.rs", "src/b.rs"], &[]))
                .verdict(&sufficient_verdict("medium")),
        );
        let refused = StubEntry::Refused {
            status: 403,
            quota: 0,
        };
        let source = Arc::new(
            StubSource::new()
                .entry("src/a.rs", refused.clone())
                .entry("src/b.rs", refused),
        );
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.outcome, Outcome::Done);
        assert!(result.fetched_paths.is_empty());
        assert!(log_contains(&result, "0 request(s) remaining"));
    }

    #[tokio::test]
    async fn test_without_repository_nothing_is_fetched() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&["README.md"], &["abc"]))
                .verdict(&sufficient_verdict("low")),
        );
        let source = Arc::new(StubSource::new().file("README.md", "# Widgets"));
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::GeneralQa, &AgentContext::default(), None)
            .await;

        assert_eq!(result.outcome, Outcome::Done);
        assert_eq!(result.step_count, 2);
        assert!(result.fetched_paths.is_empty());
        assert_eq!(result.referenced_commits, vec!["abc"]);
        assert!(source.calls().is_empty());
        assert!(log_contains(&result, "evidence fetching disabled"));
    }

    #[tokio::test]
    async fn test_evaluator_failure_continues_then_forces_done() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict_fails("evaluator down")
                .verdict_fails("evaluator down")
                .verdict_fails("evaluator down"),
        );
        let source = Arc::new(StubSource::new());
        let result = orchestrator(&oracle, &source, 3)
            .run(AgentKind::ProgressAnalysis, &AgentContext::new(REPO), None)
            .await;

        assert_eq!(result.outcome, Outcome::Done);
        assert_eq!(result.step_count, 3);
        assert_eq!(result.confidence, Confidence::Low);
    }

    struct ChecklistDispatcher;

    impl PromptDispatcher for ChecklistDispatcher {
        fn initial_prompt(
            &self,
            _ctx: &AgentContext,
            user_message: Option<&str>,
            _acc: &Accumulator,
            step: usize,
        ) -> String {
            format!("checklist {}: {}", step, user_message.unwrap_or_default())
        }

        fn followup_prompt(
            &self,
            _ctx: &AgentContext,
            previous: &StepResult,
            _user_message: Option<&str>,
            acc: &Accumulator,
            step: usize,
        ) -> String {
            format!(
                "checklist {} after {} with {} file(s)",
                step,
                previous.step_index,
                acc.fetched_paths().len()
            )
        }
    }

    #[tokio::test]
    async fn test_inserted_strategy_drives_prompts() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .always_step(&step_json(0))
                .verdict(&insufficient_verdict(&["README.md"], &[]))
                .verdict(&sufficient_verdict("high")),
        );
        let source = Arc::new(StubSource::new().file("README.md", "# Widgets"));
        let mut strategies = StrategyTable::empty();
        strategies.insert(AgentStrategy {
            kind: AgentKind::TaskAssignment,
            system_prompt: "You assign work.".to_string(),
            dispatcher: Box::new(ChecklistDispatcher),
            heuristics: HeuristicFiles::new(&[], &[]),
        });
        let result = Orchestrator::new(oracle.clone(), source, strategies, config(5))
            .run(AgentKind::TaskAssignment, &AgentContext::new(REPO), Some("who takes auth?"))
            .await;

        assert_eq!(result.outcome, Outcome::Done);
        assert_eq!(
            oracle.step_prompts(),
            vec![
                "checklist 1: who takes auth?".to_string(),
                "checklist 2 after 1 with 1 file(s)".to_string(),
            ]
        );
        assert!(oracle
            .calls()
            .iter()
            .any(|call| call.system == "You assign work."));
    }

    #[tokio::test]
    async fn test_missing_strategy_fails_cleanly() {
        let oracle = Arc::new(ScriptedOracle::new());
        let source = Arc::new(StubSource::new());
        let orchestrator = Orchestrator::new(
            oracle.clone(),
            source,
            StrategyTable::empty(),
            config(10),
        );
        let result = orchestrator
            .run(AgentKind::TaskAssignment, &AgentContext::new(REPO), None)
            .await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(oracle.calls().is_empty());
    }

    #[tokio::test]
    async fn test_progress_log_checkpoints() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .step(&step_json(1))
                .verdict(&sufficient_verdict("high")),
        );
        let source = Arc::new(StubSource::new());
        let result = orchestrator(&oracle, &source, 10)
            .run(AgentKind::GeneralQa, &AgentContext::new(REPO), None)
            .await;

        assert!(result.progress_log[0].starts_with("starting general Q&A"));
        assert!(log_contains(&result, "step 1/10 started"));
        assert!(log_contains(&result, "evaluation: sufficient=true"));
        assert!(result
            .progress_log
            .last()
            .unwrap()
            .starts_with("finished after 1 step(s)"));
    }

    #[test]
    fn test_pending_paths_filters_known_and_repeats() {
        let mut acc = Accumulator::new();
        acc.add_file(crate::agent::accumulator::FetchedFile {
            path: "README.md".to_string(),
            content: String::new(),
            truncated: false,
        });
        let requested: Vec<String> = ["README.md", " src/a.rs", "/src/a.rs", "", "src/b.rs"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(pending_paths(&requested, &acc), vec!["src/a.rs", "src/b.rs"]);
    }
}
