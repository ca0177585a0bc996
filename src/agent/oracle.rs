//! The reasoning oracle and its OpenRouter implementation.

use crate::error::AgentError;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Black-box text completion: `(prompt, system prompt) -> text`.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn complete(&self, prompt: &str, system: &str) -> anyhow::Result<String>;
}

/// OpenRouter direct API URL (BYOK mode)
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

const MAX_TOKENS: u32 = 8192;

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff
/// Floor for a single attempt once the call budget is split across retries
const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Extract retry-after hint from OpenRouter response (if present)
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

fn backoff_secs(attempt: u32) -> u64 {
    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(attempt.saturating_sub(1))) / 1000
}

/// Per-attempt HTTP timeout for a call allowed `budget` in total.
fn attempt_timeout(budget: Duration) -> Duration {
    (budget / (MAX_RETRIES + 1)).max(MIN_ATTEMPT_TIMEOUT).min(budget)
}

/// Whether a retry after `wait` still starts before `deadline`.
fn retry_fits(now: Instant, wait: Duration, deadline: Instant) -> bool {
    now + wait < deadline
}

/// Chat-completions oracle backed by OpenRouter.
///
/// `budget` bounds one `complete` call including its 429/5xx retries. A
/// retry whose backoff would overrun the budget is not attempted.
pub struct OpenRouterOracle {
    http: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
    budget: Duration,
}

impl OpenRouterOracle {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, budget: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(attempt_timeout(budget))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            url: OPENROUTER_URL.to_string(),
            budget,
        })
    }

    async fn send_with_retry(&self, request: &ChatRequest<'_>) -> anyhow::Result<String> {
        let deadline = Instant::now() + self.budget;
        let mut retry_count = 0;

        loop {
            let response = self
                .http
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-Title", "pmscope")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(request)
                .send()
                .await
                .map_err(map_transport_error)?;

            let status = response.status();
            let text = response.text().await.map_err(map_transport_error)?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    AgentError::malformed(format!(
                        "Failed to parse OpenRouter response: {} ({})",
                        e,
                        truncate_str(&text, 200)
                    ))
                })?;
                return parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| AgentError::malformed("OpenRouter returned no content").into());
            }

            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && retry_count < MAX_RETRIES {
                let wait = parse_retry_after(&text).unwrap_or_else(|| backoff_secs(retry_count + 1));
                if retry_fits(Instant::now(), Duration::from_secs(wait), deadline) {
                    retry_count += 1;
                    warn!(
                        "OpenRouter returned {}; retrying in {}s (attempt {}/{})",
                        status, wait, retry_count, MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
                warn!(
                    "OpenRouter returned {}; no time left in the {}s budget to retry",
                    status,
                    self.budget.as_secs()
                );
            }

            let error_msg = match status.as_u16() {
                401 => "Invalid API key. Run 'pmscope setup --api-key <key>' to update it.".to_string(),
                429 => format!(
                    "Rate limited by OpenRouter after {} retries. Try again in a few minutes.",
                    retry_count
                ),
                500..=599 => format!(
                    "OpenRouter server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!(
                    "API error {}: {}",
                    status,
                    crate::github::sanitize_error_body(&text)
                ),
            };
            return Err(AgentError::Remote {
                status: status.as_u16(),
                message: error_msg,
                quota_remaining: None,
            }
            .into());
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        AgentError::transport("OpenRouter request timed out").into()
    } else {
        AgentError::transport(format!("Could not reach OpenRouter: {}", err)).into()
    }
}

#[async_trait]
impl Oracle for OpenRouterOracle {
    async fn complete(&self, prompt: &str, system: &str) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                Message {
                    role: "system",
                    content: system,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: MAX_TOKENS,
            stream: false,
        };
        self.send_with_retry(&request).await
    }
}

/// Truncate a string for display (Unicode-safe)
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}
