//! Multi-step analysis agents.
//!
//! An `Orchestrator` run drives one agent kind through repeated oracle steps,
//! checking after each whether the answer is good enough and fetching more
//! repository evidence when it is not.

pub mod accumulator;
pub mod dispatch;
pub mod evaluator;
pub mod models;
pub mod oracle;
pub mod orchestrator;
pub mod parse;
pub mod prompts;
pub mod router;

pub use accumulator::{Accumulator, FetchedFile};
pub use dispatch::{AgentStrategy, HeuristicFiles, PromptDispatcher, StrategyTable, TemplateDispatcher};
pub use evaluator::SufficiencyEvaluator;
pub use models::{
    AgentContext, AgentKind, Confidence, OrchestrationResult, Outcome, StepResult,
    SufficiencyVerdict,
};
pub use oracle::{OpenRouterOracle, Oracle};
pub use orchestrator::Orchestrator;
pub use parse::parse_structured_record;
pub use router::{classify_intent, IntentClassification};
