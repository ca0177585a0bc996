//! Scripted stand-ins for the oracle and the content source.

use crate::agent::oracle::Oracle;
use crate::agent::prompts::EVALUATOR_SYSTEM_PROMPT;
use crate::error::AgentError;
use crate::github::{
    CommitDetail, CommitFileChange, ContentSource, DirEntry, EntryKind, RemoteResponse,
    RepoContents, RepoHandle,
};
use async_trait::async_trait;
use base64::Engine;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    Hang,
}

#[derive(Debug, Clone)]
pub struct OracleCall {
    pub prompt: String,
    pub system: String,
}

/// Oracle that replays canned answers. Evaluator calls (recognised by their
/// system prompt) and step calls draw from separate queues.
#[derive(Default)]
pub struct ScriptedOracle {
    steps: Mutex<VecDeque<Reply>>,
    verdicts: Mutex<VecDeque<Reply>>,
    step_fallback: Option<String>,
    verdict_fallback: Option<String>,
    calls: Mutex<Vec<OracleCall>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_step(self, reply: Reply) -> Self {
        self.steps.lock().unwrap().push_back(reply);
        self
    }

    fn push_verdict(self, reply: Reply) -> Self {
        self.verdicts.lock().unwrap().push_back(reply);
        self
    }

    pub fn step(self, text: &str) -> Self {
        self.push_step(Reply::Text(text.to_string()))
    }

    pub fn step_fails(self, msg: &str) -> Self {
        self.push_step(Reply::Fail(msg.to_string()))
    }

    pub fn step_hangs(self) -> Self {
        self.push_step(Reply::Hang)
    }

    pub fn verdict(self, text: &str) -> Self {
        self.push_verdict(Reply::Text(text.to_string()))
    }

    pub fn verdict_fails(self, msg: &str) -> Self {
        self.push_verdict(Reply::Fail(msg.to_string()))
    }

    pub fn verdict_hangs(self) -> Self {
        self.push_verdict(Reply::Hang)
    }

    /// Answer every step call without a queued reply with `text`.
    pub fn always_step(mut self, text: &str) -> Self {
        self.step_fallback = Some(text.to_string());
        self
    }

    pub fn always_verdict(mut self, text: &str) -> Self {
        self.verdict_fallback = Some(text.to_string());
        self
    }

    pub fn calls(&self) -> Vec<OracleCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn step_prompts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.system != EVALUATOR_SYSTEM_PROMPT)
            .map(|c| c.prompt)
            .collect()
    }

    pub fn evaluator_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.system == EVALUATOR_SYSTEM_PROMPT)
            .count()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn complete(&self, prompt: &str, system: &str) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(OracleCall {
            prompt: prompt.to_string(),
            system: system.to_string(),
        });
        let is_verdict = system == EVALUATOR_SYSTEM_PROMPT;
        let (queue, fallback) = if is_verdict {
            (&self.verdicts, &self.verdict_fallback)
        } else {
            (&self.steps, &self.step_fallback)
        };
        let next = queue.lock().unwrap().pop_front();
        match next.or_else(|| fallback.clone().map(Reply::Text)) {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(msg)) => Err(anyhow::anyhow!(msg)),
            Some(Reply::Hang) => std::future::pending().await,
            None => Err(anyhow::anyhow!("script exhausted")),
        }
    }
}

pub fn sufficient_verdict(confidence: &str) -> String {
    format!(
        r#"{{"is_sufficient": true, "confidence": "{}", "needs_more_info": false, "files_to_read": [], "commits_to_analyze": [], "reason": "enough"}}"#,
        confidence
    )
}

pub fn insufficient_verdict(files: &[&str], commits: &[&str]) -> String {
    serde_json::json!({
        "is_sufficient": false,
        "confidence": "low",
        "needs_more_info": true,
        "files_to_read": files,
        "commits_to_analyze": commits,
        "reason": "need more"
    })
    .to_string()
}

#[derive(Debug, Clone)]
pub enum StubEntry {
    /// Plain text, served base64-encoded like the real API
    File(String),
    Dir(Vec<DirEntry>),
    Other(String),
    Fail(String),
    /// Non-success status that still reports the remaining quota
    Refused { status: u16, quota: u32 },
    Hang,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory repository.
#[derive(Default)]
pub struct StubSource {
    entries: HashMap<String, StubEntry>,
    commits: HashMap<String, CommitDetail>,
    delay: Option<Duration>,
    quotas: Mutex<VecDeque<u32>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, path: &str, entry: StubEntry) -> Self {
        self.entries.insert(path.to_string(), entry);
        self
    }

    pub fn file(self, path: &str, content: &str) -> Self {
        self.entry(path, StubEntry::File(content.to_string()))
    }

    pub fn dir(self, path: &str, children: &[(&str, EntryKind)]) -> Self {
        let entries = children
            .iter()
            .map(|(p, kind)| DirEntry {
                path: p.to_string(),
                kind: *kind,
            })
            .collect();
        self.entry(path, StubEntry::Dir(entries))
    }

    pub fn commit(mut self, sha: &str, message: &str, files: &[(&str, &str)]) -> Self {
        let detail = CommitDetail {
            sha: sha.to_string(),
            message: message.to_string(),
            files: files
                .iter()
                .map(|(name, patch)| CommitFileChange {
                    filename: name.to_string(),
                    status: "modified".to_string(),
                    additions: 1,
                    deletions: 0,
                    patch: Some(patch.to_string()),
                })
                .collect(),
        };
        self.commits.insert(sha.to_string(), detail);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Quota values reported by successive calls.
    pub fn with_quota_sequence(self, quotas: &[u32]) -> Self {
        self.quotas.lock().unwrap().extend(quotas.iter().copied());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond<T>(&self, body: T) -> RemoteResponse<T> {
        let response = RemoteResponse::new(body);
        match self.quotas.lock().unwrap().pop_front() {
            Some(quota) => response.with_quota(quota),
            None => response,
        }
    }
}

#[async_trait]
impl ContentSource for StubSource {
    async fn get_contents(
        &self,
        _repo: &RepoHandle,
        path: &str,
    ) -> anyhow::Result<RemoteResponse<RepoContents>> {
        self.calls.lock().unwrap().push(path.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.entries.get(path).cloned() {
            Some(StubEntry::File(text)) => Ok(self.respond(RepoContents::File {
                path: path.to_string(),
                encoding: Some("base64".to_string()),
                content: base64::engine::general_purpose::STANDARD.encode(text.as_bytes()),
            })),
            Some(StubEntry::Dir(entries)) => Ok(self.respond(RepoContents::Directory(entries))),
            Some(StubEntry::Other(kind)) => Ok(self.respond(RepoContents::Other {
                path: path.to_string(),
                kind,
            })),
            Some(StubEntry::Fail(msg)) => Err(anyhow::anyhow!(msg)),
            Some(StubEntry::Refused { status, quota }) => Err(AgentError::Remote {
                status,
                message: "API rate limit exceeded".to_string(),
                quota_remaining: Some(quota),
            }
            .into()),
            Some(StubEntry::Hang) => std::future::pending().await,
            None => Err(anyhow::anyhow!("not found: {}", path)),
        }
    }

    async fn get_commit(
        &self,
        _repo: &RepoHandle,
        sha: &str,
    ) -> anyhow::Result<RemoteResponse<CommitDetail>> {
        self.calls.lock().unwrap().push(format!("commit:{}", sha));
        match self.commits.get(sha).cloned() {
            Some(detail) => Ok(self.respond(detail)),
            None => Err(anyhow::anyhow!("not found: commit {}", sha)),
        }
    }
}
