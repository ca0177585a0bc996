//! Sufficiency evaluation: a second oracle call judging each step's answer.

use super::models::{AgentKind, StepResult, SufficiencyVerdict};
use super::oracle::Oracle;
use super::parse::parse_structured_record;
use super::prompts::{evaluation_prompt, EVALUATOR_SYSTEM_PROMPT};
use std::time::Duration;
use tracing::{debug, warn};

pub struct SufficiencyEvaluator<'a> {
    oracle: &'a dyn Oracle,
    max_steps: usize,
    timeout: Duration,
}

impl<'a> SufficiencyEvaluator<'a> {
    pub fn new(oracle: &'a dyn Oracle, max_steps: usize, timeout: Duration) -> Self {
        Self {
            oracle,
            max_steps,
            timeout,
        }
    }

    /// Judge `current`. Never fails: any oracle, timeout or parse problem
    /// yields the conservative verdict. At the step limit the verdict is
    /// forced sufficient whatever the oracle said.
    pub async fn evaluate(
        &self,
        current: &StepResult,
        kind: AgentKind,
        step: usize,
    ) -> SufficiencyVerdict {
        let verdict = match self.ask(current, kind, step).await {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!("sufficiency evaluation failed at step {}: {:#}", step, err);
                return SufficiencyVerdict::conservative(
                    step,
                    self.max_steps,
                    format!("evaluation failed: {:#}", err),
                );
            }
        };

        if step >= self.max_steps {
            return SufficiencyVerdict {
                is_sufficient: true,
                needs_more_info: false,
                reason: format!("reached the step limit ({})", self.max_steps),
                ..verdict
            };
        }
        verdict
    }

    async fn ask(
        &self,
        current: &StepResult,
        kind: AgentKind,
        step: usize,
    ) -> anyhow::Result<SufficiencyVerdict> {
        let prompt = evaluation_prompt(current, kind, step, self.max_steps);
        let text = tokio::time::timeout(
            self.timeout,
            self.oracle.complete(&prompt, EVALUATOR_SYSTEM_PROMPT),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {}s", self.timeout.as_secs()))??;

        let record = parse_structured_record(&text)?;
        let verdict: SufficiencyVerdict = serde_json::from_value(serde_json::Value::Object(record))?;
        let verdict = verdict.normalized();
        debug!(
            "verdict at step {}: sufficient={} confidence={} files={:?}",
            step,
            verdict.is_sufficient,
            verdict.confidence.as_str(),
            verdict.files_to_fetch
        );
        Ok(verdict)
    }
}
