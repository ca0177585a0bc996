//! Per-agent strategies: prompt dispatcher, system prompt and fallback evidence.

use super::accumulator::Accumulator;
use super::models::{AgentContext, AgentKind, StepResult};
use super::prompts;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Builds the prompt for each step of a run.
pub trait PromptDispatcher: Send + Sync {
    fn initial_prompt(
        &self,
        ctx: &AgentContext,
        user_message: Option<&str>,
        acc: &Accumulator,
        step: usize,
    ) -> String;

    fn followup_prompt(
        &self,
        ctx: &AgentContext,
        previous: &StepResult,
        user_message: Option<&str>,
        acc: &Accumulator,
        step: usize,
    ) -> String;
}

/// Dispatcher backed by the built-in templates for one agent kind.
#[derive(Debug, Clone, Copy)]
pub struct TemplateDispatcher {
    kind: AgentKind,
}

impl TemplateDispatcher {
    pub fn new(kind: AgentKind) -> Self {
        Self { kind }
    }
}

impl PromptDispatcher for TemplateDispatcher {
    fn initial_prompt(
        &self,
        ctx: &AgentContext,
        user_message: Option<&str>,
        acc: &Accumulator,
        step: usize,
    ) -> String {
        prompts::initial_prompt(self.kind, ctx, user_message, acc, step)
    }

    fn followup_prompt(
        &self,
        ctx: &AgentContext,
        previous: &StepResult,
        user_message: Option<&str>,
        acc: &Accumulator,
        step: usize,
    ) -> String {
        prompts::followup_prompt(self.kind, ctx, previous, user_message, acc, step)
    }
}

/// Evidence fetched when the evaluator wants more but names nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeuristicFiles {
    #[serde(default)]
    pub files: Vec<String>,
    /// Directories whose source files are listed and fetched
    #[serde(default)]
    pub scan_dirs: Vec<String>,
}

impl HeuristicFiles {
    pub fn new(files: &[&str], scan_dirs: &[&str]) -> Self {
        Self {
            files: files.iter().map(|s| s.to_string()).collect(),
            scan_dirs: scan_dirs.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.scan_dirs.is_empty()
    }

    /// Built-in fallback evidence per agent kind.
    pub fn defaults_for(kind: AgentKind) -> Self {
        match kind {
            AgentKind::TaskSuggestion => Self::new(
                &["README.md", "package.json", "Cargo.toml", "requirements.txt"],
                &["src"],
            ),
            AgentKind::ProgressAnalysis => Self::new(&["README.md"], &[]),
            AgentKind::TaskCompletion => Self::new(&[], &["src"]),
            AgentKind::GeneralQa => Self::new(&["README.md"], &[]),
            AgentKind::TaskAssignment => Self::new(&["README.md", "package.json"], &[]),
        }
    }
}

pub struct AgentStrategy {
    pub kind: AgentKind,
    pub system_prompt: String,
    pub dispatcher: Box<dyn PromptDispatcher>,
    pub heuristics: HeuristicFiles,
}

impl AgentStrategy {
    pub fn builtin(kind: AgentKind) -> Self {
        Self {
            kind,
            system_prompt: prompts::system_prompt(kind).to_string(),
            dispatcher: Box::new(TemplateDispatcher::new(kind)),
            heuristics: HeuristicFiles::defaults_for(kind),
        }
    }
}

/// Strategy lookup keyed by agent kind.
pub struct StrategyTable {
    strategies: HashMap<AgentKind, AgentStrategy>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self {
            strategies: AgentKind::ALL
                .into_iter()
                .map(|kind| (kind, AgentStrategy::builtin(kind)))
                .collect(),
        }
    }
}

impl StrategyTable {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Replace fallback evidence for the kinds named in `overrides`.
    pub fn with_overrides(mut self, overrides: &HashMap<AgentKind, HeuristicFiles>) -> Self {
        for (kind, files) in overrides {
            if let Some(strategy) = self.strategies.get_mut(kind) {
                strategy.heuristics = files.clone();
            }
        }
        self
    }

    pub fn insert(&mut self, strategy: AgentStrategy) {
        self.strategies.insert(strategy.kind, strategy);
    }

    pub fn get(&self, kind: AgentKind) -> Option<&AgentStrategy> {
        self.strategies.get(&kind)
    }
}
