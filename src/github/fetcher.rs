//! Evidence fetcher: file contents, directory listings and commit details.
//!
//! Every retrieval is isolated. A failing path turns into a `FetchResult`
//! carrying an error and never disturbs its siblings. Nothing here touches
//! the run's accumulator; callers merge the returned batches themselves.

use super::{CommitDetail, ContentSource, EntryKind, RepoContents, RepoHandle};
use crate::error::AgentError;
use anyhow::Context;
use base64::Engine;
use futures::{stream, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Extensions treated as source code by directory listings.
const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "mjs", "cjs", "java", "kt", "kts", "go", "rb", "php",
    "cs", "c", "h", "cc", "cpp", "hpp", "swift", "scala", "vue", "svelte", "dart", "sql", "sh",
];

/// Patch lines kept per changed file in a commit.
const MAX_PATCH_LINES: usize = 120;
/// Changed files kept per commit.
const MAX_COMMIT_FILES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchLimits {
    pub concurrency: usize,
    pub max_files_per_call: usize,
    /// 0 disables truncation
    pub max_lines_per_file: usize,
    pub max_listed_files: usize,
    pub timeout: Duration,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self::from(&crate::config::OrchestratorConfig::default())
    }
}

impl From<&crate::config::OrchestratorConfig> for FetchLimits {
    fn from(config: &crate::config::OrchestratorConfig) -> Self {
        Self {
            concurrency: config.fetch_concurrency,
            max_files_per_call: config.max_files_per_call,
            max_lines_per_file: config.max_lines_per_file,
            max_listed_files: config.max_listed_files,
            timeout: config.fetch_timeout,
        }
    }
}

/// Outcome of fetching one path. Exactly one of `content` / `error` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    pub path: String,
    pub content: Option<String>,
    pub truncated: bool,
    pub total_lines: Option<usize>,
    pub error: Option<String>,
}

impl FetchResult {
    fn ok(path: &str, content: String, truncated: bool, total_lines: usize) -> Self {
        Self {
            path: path.to_string(),
            content: Some(content),
            truncated,
            total_lines: Some(total_lines),
            error: None,
        }
    }

    fn failed(path: &str, error: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            content: None,
            truncated: false,
            total_lines: None,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.content.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    /// One entry per accepted path, in request order
    pub results: Vec<FetchResult>,
    /// Lowest remaining quota reported during the batch
    pub quota_remaining: Option<u32>,
    /// Paths ignored because the batch exceeded `max_files_per_call`
    pub dropped: Vec<String>,
}

impl FetchBatch {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryListing {
    pub files: Vec<String>,
    pub quota_remaining: Option<u32>,
    /// Subdirectories that could not be listed
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitFileEvidence {
    pub filename: String,
    pub status: String,
    pub additions: u64,
    pub deletions: u64,
    pub patch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvidence {
    pub sha: String,
    pub message: String,
    pub files: Vec<CommitFileEvidence>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFetch {
    pub sha: String,
    pub detail: Option<CommitEvidence>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub results: Vec<CommitFetch>,
    pub quota_remaining: Option<u32>,
}

fn min_quota(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Quota reported by a refused request, when the remote sent one.
fn error_quota(err: &anyhow::Error) -> Option<u32> {
    err.downcast_ref::<AgentError>()
        .and_then(AgentError::quota_remaining)
}

/// Whether a path looks like source code worth handing to the oracle.
pub fn is_source_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            SOURCE_EXTENSIONS.contains(&ext.as_str())
        }
        _ => false,
    }
}

/// Decode a contents payload. GitHub wraps base64 at 60 columns.
pub(crate) fn decode_content(encoding: Option<&str>, raw: &str) -> anyhow::Result<String> {
    match encoding {
        Some("base64") => {
            let compact: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(compact.as_bytes())
                .context("invalid base64 content")?;
            String::from_utf8(bytes).context("content is not valid UTF-8")
        }
        Some("") | Some("utf-8") | None => Ok(raw.to_string()),
        Some(other) => Err(anyhow::anyhow!("unsupported content encoding '{}'", other)),
    }
}

/// Keep at most `max_lines` lines. Returns (content, truncated, total_lines).
pub(crate) fn truncate_lines(content: &str, max_lines: usize) -> (String, bool, usize) {
    let total = content.split('\n').count();
    if max_lines == 0 || total <= max_lines {
        return (content.to_string(), false, total);
    }
    let kept: Vec<&str> = content.split('\n').take(max_lines).collect();
    (kept.join("\n"), true, total)
}

async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::transport(format!(
            "{} timed out after {}s",
            what,
            limit.as_secs_f32()
        ))
        .into()),
    }
}

/// Fetches evidence for one repository through a `ContentSource`.
pub struct EvidenceFetcher {
    source: Arc<dyn ContentSource>,
    repo: RepoHandle,
    limits: FetchLimits,
}

impl EvidenceFetcher {
    pub fn new(source: Arc<dyn ContentSource>, repo: RepoHandle, limits: FetchLimits) -> Self {
        Self {
            source,
            repo,
            limits,
        }
    }

    /// Fetch file contents. A single path is fetched inline; larger batches
    /// run with at most `concurrency` requests in flight.
    pub async fn fetch_files(&self, paths: &[String]) -> FetchBatch {
        let cap = self.limits.max_files_per_call;
        let (accepted, dropped) = if paths.len() > cap {
            warn!(
                "fetch batch of {} paths exceeds cap of {}; dropping the rest",
                paths.len(),
                cap
            );
            (&paths[..cap], paths[cap..].to_vec())
        } else {
            (paths, Vec::new())
        };

        let mut batch = FetchBatch {
            dropped,
            ..FetchBatch::default()
        };

        if let [only] = accepted {
            let (result, quota) = self.fetch_one(only).await;
            batch.results.push(result);
            batch.quota_remaining = quota;
            return batch;
        }

        let mut indexed: Vec<(usize, FetchResult, Option<u32>)> = stream::iter(
            accepted.iter().enumerate(),
        )
        .map(|(idx, path)| async move {
            let (result, quota) = self.fetch_one(path).await;
            (idx, result, quota)
        })
        .buffer_unordered(self.limits.concurrency.max(1))
        .collect()
        .await;

        indexed.sort_by_key(|(idx, _, _)| *idx);
        for (_, result, quota) in indexed {
            batch.quota_remaining = min_quota(batch.quota_remaining, quota);
            batch.results.push(result);
        }
        batch
    }

    async fn fetch_one(&self, path: &str) -> (FetchResult, Option<u32>) {
        let response = with_timeout(
            self.limits.timeout,
            path,
            self.source.get_contents(&self.repo, path),
        )
        .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                debug!("fetch of {} failed: {:#}", path, err);
                let quota = error_quota(&err);
                return (FetchResult::failed(path, format!("{:#}", err)), quota);
            }
        };
        let quota = response.quota_remaining;

        let result = match response.body {
            RepoContents::File {
                encoding, content, ..
            } => match decode_content(encoding.as_deref(), &content) {
                Ok(text) => {
                    let (text, truncated, total) =
                        truncate_lines(&text, self.limits.max_lines_per_file);
                    FetchResult::ok(path, text, truncated, total)
                }
                Err(err) => FetchResult::failed(path, format!("{:#}", err)),
            },
            RepoContents::Directory(_) => FetchResult::failed(
                path,
                AgentError::NotAFile {
                    path: path.to_string(),
                    kind: "dir".to_string(),
                }
                .to_string(),
            ),
            RepoContents::Other { kind, .. } => FetchResult::failed(
                path,
                AgentError::NotAFile {
                    path: path.to_string(),
                    kind,
                }
                .to_string(),
            ),
        };
        (result, quota)
    }

    /// List source files under `dir`, descending at most `max_depth` levels.
    ///
    /// The root listing must succeed; unreadable subdirectories are skipped.
    pub async fn list_directory(
        &self,
        dir: &str,
        max_depth: usize,
    ) -> anyhow::Result<DirectoryListing> {
        let mut listing = DirectoryListing::default();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((dir.trim_matches('/').to_string(), 0));
        let limit = self.limits.max_listed_files;

        while let Some((current, depth)) = queue.pop_front() {
            if listing.files.len() >= limit {
                break;
            }
            let response = with_timeout(
                self.limits.timeout,
                &current,
                self.source.get_contents(&self.repo, &current),
            )
            .await;

            let response = match response {
                Ok(response) => response,
                Err(err) if depth == 0 => {
                    return Err(err.context(format!("failed to list directory '{}'", current)))
                }
                Err(err) => {
                    warn!("skipping directory {}: {:#}", current, err);
                    listing.quota_remaining = min_quota(listing.quota_remaining, error_quota(&err));
                    listing.skipped.push(current);
                    continue;
                }
            };
            listing.quota_remaining = min_quota(listing.quota_remaining, response.quota_remaining);

            let entries = match response.body {
                RepoContents::Directory(entries) => entries,
                _ if depth == 0 => {
                    return Err(anyhow::Error::new(AgentError::NotAFile {
                        path: current,
                        kind: "not a directory".to_string(),
                    })
                    .context("directory listing expected"));
                }
                _ => continue,
            };

            for entry in entries {
                match entry.kind {
                    EntryKind::File if is_source_file(&entry.path) => {
                        if listing.files.len() < limit {
                            listing.files.push(entry.path);
                        }
                    }
                    EntryKind::Dir if depth < max_depth => {
                        queue.push_back((entry.path, depth + 1));
                    }
                    _ => {}
                }
            }
        }

        Ok(listing)
    }

    /// Fetch commit details with the same bounded pool as file fetches.
    pub async fn fetch_commits(&self, shas: &[String]) -> CommitBatch {
        let mut indexed: Vec<(usize, CommitFetch, Option<u32>)> =
            stream::iter(shas.iter().take(self.limits.max_files_per_call).enumerate())
                .map(|(idx, sha)| async move {
                    let (fetch, quota) = self.fetch_commit(sha).await;
                    (idx, fetch, quota)
                })
                .buffer_unordered(self.limits.concurrency.max(1))
                .collect()
                .await;
        indexed.sort_by_key(|(idx, _, _)| *idx);

        let mut batch = CommitBatch::default();
        for (_, fetch, quota) in indexed {
            batch.quota_remaining = min_quota(batch.quota_remaining, quota);
            batch.results.push(fetch);
        }
        batch
    }

    async fn fetch_commit(&self, sha: &str) -> (CommitFetch, Option<u32>) {
        let what = format!("commit {}", sha);
        match with_timeout(
            self.limits.timeout,
            &what,
            self.source.get_commit(&self.repo, sha),
        )
        .await
        {
            Ok(response) => (
                CommitFetch {
                    sha: sha.to_string(),
                    detail: Some(commit_evidence(response.body)),
                    error: None,
                },
                response.quota_remaining,
            ),
            Err(err) => (
                CommitFetch {
                    sha: sha.to_string(),
                    detail: None,
                    error: Some(format!("{:#}", err)),
                },
                error_quota(&err),
            ),
        }
    }
}

fn commit_evidence(detail: CommitDetail) -> CommitEvidence {
    CommitEvidence {
        sha: detail.sha,
        message: detail.message,
        files: detail
            .files
            .into_iter()
            .take(MAX_COMMIT_FILES)
            .map(|f| CommitFileEvidence {
                filename: f.filename,
                status: f.status,
                additions: f.additions,
                deletions: f.deletions,
                patch: f.patch.map(|p| truncate_lines(&p, MAX_PATCH_LINES).0),
            })
            .collect(),
    }
}
