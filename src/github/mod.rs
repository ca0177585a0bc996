//! GitHub REST access for evidence gathering
//!
//! `ContentSource` is the seam the orchestrator depends on; `GitHubClient` is
//! the reqwest-backed implementation talking to `api.github.com`.

pub mod fetcher;

use crate::error::AgentError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub use fetcher::{
    CommitBatch, CommitEvidence, CommitFetch, DirectoryListing, EvidenceFetcher, FetchBatch,
    FetchLimits, FetchResult,
};

const GITHUB_API_URL: &str = "https://api.github.com";
const API_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = "pmscope";

/// Header GitHub uses to report the remaining request quota.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
pub(crate) fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let truncated = if body.chars().count() > MAX_ERROR_BODY_LEN {
        let cut: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{}... (truncated)", cut)
    } else {
        body.to_string()
    };

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(error details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated
}

/// Extract owner and repo from a GitHub URL.
///
/// Supports:
/// - git@github.com:owner/repo.git
/// - https://github.com/owner/repo(.git)(/)
/// - github.com/owner/repo
pub fn parse_remote_url(url: &str) -> Option<(String, String)> {
    let url = url.trim();

    if let Some(rest) = url.strip_prefix("git@github.com:") {
        return split_owner_repo(rest);
    }

    if !url.contains("github.com") {
        return None;
    }

    if let Ok(parsed) = Url::parse(url) {
        if parsed.host_str() == Some("github.com") {
            return split_owner_repo(parsed.path());
        }
        if parsed.has_host() {
            return None;
        }
    }

    // URLs without scheme
    let path = url.split("github.com").nth(1)?;
    if !path.starts_with(['/', ':']) {
        return None;
    }
    split_owner_repo(path)
}

fn split_owner_repo(path: &str) -> Option<(String, String)> {
    let path = path.trim_matches('/');
    let path = path.trim_start_matches(':');
    let mut parts = path.splitn(3, '/');
    let owner = parts.next()?.trim();
    let repo = parts.next()?.trim().trim_end_matches('/');
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Owner/name pair of a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIdentity {
    pub owner: String,
    pub name: String,
}

impl RepoIdentity {
    pub fn parse(url: &str) -> Result<Self, AgentError> {
        parse_remote_url(url)
            .map(|(owner, name)| Self { owner, name })
            .ok_or_else(|| AgentError::InvalidRepoUrl(url.to_string()))
    }

    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Everything needed to address one repository on behalf of one run.
#[derive(Debug, Clone)]
pub struct RepoHandle {
    pub identity: RepoIdentity,
    pub token: Option<String>,
    pub git_ref: Option<String>,
}

impl RepoHandle {
    pub fn new(identity: RepoIdentity) -> Self {
        Self {
            identity,
            token: None,
            git_ref: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_ref(mut self, git_ref: Option<String>) -> Self {
        self.git_ref = git_ref.filter(|r| !r.trim().is_empty());
        self
    }
}

/// A response body plus the quota the remote reported alongside it.
#[derive(Debug, Clone)]
pub struct RemoteResponse<T> {
    pub body: T,
    pub quota_remaining: Option<u32>,
}

impl<T> RemoteResponse<T> {
    pub fn new(body: T) -> Self {
        Self {
            body,
            quota_remaining: None,
        }
    }

    pub fn with_quota(mut self, remaining: u32) -> Self {
        self.quota_remaining = Some(remaining);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub kind: EntryKind,
}

/// What the contents endpoint returned for a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoContents {
    File {
        path: String,
        encoding: Option<String>,
        content: String,
    },
    Directory(Vec<DirEntry>),
    /// Symlinks, submodules and anything else that is not a plain file
    Other { path: String, kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFileChange {
    pub filename: String,
    pub status: String,
    pub additions: u64,
    pub deletions: u64,
    pub patch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDetail {
    pub sha: String,
    pub message: String,
    pub files: Vec<CommitFileChange>,
}

/// Remote repository host the evidence fetcher reads from.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// `GET /repos/{owner}/{repo}/contents/{path}[?ref=...]`
    async fn get_contents(
        &self,
        repo: &RepoHandle,
        path: &str,
    ) -> Result<RemoteResponse<RepoContents>>;

    /// `GET /repos/{owner}/{repo}/commits/{sha}`
    async fn get_commit(&self, repo: &RepoHandle, sha: &str)
        -> Result<RemoteResponse<CommitDetail>>;
}

#[derive(Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContentsPayload {
    Listing(Vec<ContentItem>),
    Item(ContentItem),
}

fn entry_kind(kind: &str) -> EntryKind {
    match kind {
        "file" => EntryKind::File,
        "dir" => EntryKind::Dir,
        _ => EntryKind::Other,
    }
}

fn parse_contents_payload(text: &str) -> Result<RepoContents> {
    let payload: ContentsPayload =
        serde_json::from_str(text).context("Failed to parse contents response")?;
    Ok(match payload {
        ContentsPayload::Listing(items) => RepoContents::Directory(
            items
                .into_iter()
                .map(|item| DirEntry {
                    kind: entry_kind(&item.kind),
                    path: item.path,
                })
                .collect(),
        ),
        ContentsPayload::Item(item) if item.kind == "file" => RepoContents::File {
            path: item.path,
            encoding: item.encoding,
            content: item.content.unwrap_or_default(),
        },
        ContentsPayload::Item(item) => RepoContents::Other {
            path: item.path,
            kind: item.kind,
        },
    })
}

#[derive(Deserialize)]
struct CommitPayload {
    sha: String,
    commit: CommitMessagePayload,
    #[serde(default)]
    files: Vec<CommitFilePayload>,
}

#[derive(Deserialize)]
struct CommitMessagePayload {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct CommitFilePayload {
    filename: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    #[serde(default)]
    patch: Option<String>,
}

fn parse_commit_payload(text: &str) -> Result<CommitDetail> {
    let payload: CommitPayload =
        serde_json::from_str(text).context("Failed to parse commit response")?;
    Ok(CommitDetail {
        sha: payload.sha,
        message: payload.commit.message,
        files: payload
            .files
            .into_iter()
            .map(|f| CommitFileChange {
                filename: f.filename,
                status: f.status,
                additions: f.additions,
                deletions: f.deletions,
                patch: f.patch,
            })
            .collect(),
    })
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
}

/// reqwest-backed `ContentSource` for github.com.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    base_url: String,
}

impl GitHubClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(GITHUB_API_URL)
    }

    /// Point the client at another API root (GitHub Enterprise, test servers).
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, repo: &RepoHandle, tail: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).context("Invalid GitHub API base URL")?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("GitHub API base URL cannot carry a path"))?
            .pop_if_empty()
            .extend([
                "repos",
                repo.identity.owner.as_str(),
                repo.identity.name.as_str(),
            ])
            .extend(tail.iter().flat_map(|part| part.split('/')).filter(|s| !s.is_empty()));
        Ok(url)
    }

    pub(crate) fn contents_url(&self, repo: &RepoHandle, path: &str) -> Result<Url> {
        let mut url = self.endpoint(repo, &["contents", path])?;
        if let Some(git_ref) = &repo.git_ref {
            url.query_pairs_mut().append_pair("ref", git_ref);
        }
        Ok(url)
    }

    async fn get_text(&self, repo: &RepoHandle, url: Url, what: &str) -> Result<(String, Option<u32>)> {
        let mut request = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &repo.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let resp = request.send().await.map_err(|err| {
            if err.is_timeout() {
                AgentError::transport(format!("GitHub request for {} timed out", what))
            } else {
                AgentError::transport(format!("Could not reach GitHub for {}: {}", what, err))
            }
        })?;

        let status = resp.status();
        let quota = resp
            .headers()
            .get(RATE_LIMIT_REMAINING_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());
        let body = resp
            .text()
            .await
            .map_err(|err| AgentError::transport(format!("Failed to read {}: {}", what, err)))?;

        if status.is_success() {
            return Ok((body, quota));
        }

        let message = match status.as_u16() {
            404 => format!("not found: {}", what),
            _ => serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| sanitize_error_body(&e.message))
                .unwrap_or_else(|_| sanitize_error_body(&body)),
        };
        Err(AgentError::Remote {
            status: status.as_u16(),
            message,
            quota_remaining: quota,
        }
        .into())
    }
}

#[async_trait]
impl ContentSource for GitHubClient {
    async fn get_contents(
        &self,
        repo: &RepoHandle,
        path: &str,
    ) -> Result<RemoteResponse<RepoContents>> {
        let url = self.contents_url(repo, path)?;
        let (text, quota) = self.get_text(repo, url, path).await?;
        Ok(RemoteResponse {
            body: parse_contents_payload(&text)?,
            quota_remaining: quota,
        })
    }

    async fn get_commit(
        &self,
        repo: &RepoHandle,
        sha: &str,
    ) -> Result<RemoteResponse<CommitDetail>> {
        let url = self.endpoint(repo, &["commits", sha])?;
        let (text, quota) = self.get_text(repo, url, &format!("commit {}", sha)).await?;
        Ok(RemoteResponse {
            body: parse_commit_payload(&text)?,
            quota_remaining: quota,
        })
    }
}
