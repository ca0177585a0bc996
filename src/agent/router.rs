//! Intent routing: choose an agent kind for a free-form message.

use super::models::{AgentKind, Confidence};
use super::oracle::Oracle;
use super::parse::parse_structured_record;
use super::prompts::{intent_prompt, ROUTER_SYSTEM_PROMPT};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

const FALLBACK_AGENT: AgentKind = AgentKind::ProgressAnalysis;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentClassification {
    pub agent_kind: AgentKind,
    pub confidence: Confidence,
    pub reason: String,
    pub extracted_info: Map<String, Value>,
}

impl IntentClassification {
    fn fallback(reason: String) -> Self {
        Self {
            agent_kind: FALLBACK_AGENT,
            confidence: Confidence::Low,
            reason,
            extracted_info: Map::new(),
        }
    }
}

/// Ask the oracle which agent should handle `user_message`.
///
/// Never fails. An unusable or late answer routes to progress analysis with
/// low confidence; a usable answer missing only its confidence gets medium.
pub async fn classify_intent(
    oracle: &dyn Oracle,
    user_message: &str,
    history: &[String],
    timeout: Duration,
) -> IntentClassification {
    let prompt = intent_prompt(user_message, history);
    let reply = tokio::time::timeout(timeout, oracle.complete(&prompt, ROUTER_SYSTEM_PROMPT)).await;
    let text = match reply {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => {
            warn!("intent classification failed: {:#}", err);
            return IntentClassification::fallback(format!("classification failed: {:#}", err));
        }
        Err(_) => {
            warn!("intent classification timed out after {}s", timeout.as_secs_f32());
            return IntentClassification::fallback("classification timed out".to_string());
        }
    };
    let record = match parse_structured_record(&text) {
        Ok(record) => record,
        Err(err) => {
            warn!("intent classification unparseable: {}", err);
            return IntentClassification::fallback(format!("classification failed: {}", err));
        }
    };
    let classification = interpret(record);
    debug!(
        "routed to {} ({})",
        classification.agent_kind,
        classification.confidence.as_str()
    );
    classification
}

fn interpret(mut record: Map<String, Value>) -> IntentClassification {
    let reason = match record.remove("reason") {
        Some(Value::String(s)) => s,
        _ => String::new(),
    };
    let extracted_info = match record.remove("extracted_info") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let kind = record
        .get("agent_type")
        .or_else(|| record.get("agentType"))
        .and_then(Value::as_str)
        .map(str::parse::<AgentKind>);
    let agent_kind = match kind {
        Some(Ok(kind)) => kind,
        Some(Err(err)) => {
            return IntentClassification {
                reason: err,
                extracted_info,
                ..IntentClassification::fallback(String::new())
            }
        }
        None => {
            return IntentClassification {
                reason: "no agent_type in classification".to_string(),
                extracted_info,
                ..IntentClassification::fallback(String::new())
            }
        }
    };

    let confidence = match record.get("confidence").and_then(Value::as_str) {
        None => Confidence::Medium,
        Some(raw) => Confidence::parse_lenient(raw).unwrap_or(Confidence::Low),
    };

    IntentClassification {
        agent_kind,
        confidence,
        reason,
        extracted_info,
    }
}
