//! Per-run evidence and history.

use super::models::StepResult;
use crate::github::{CommitEvidence, FetchResult};
use serde::Serialize;
use std::collections::HashSet;
use tracing::info;

/// A file the run has read, as handed to the prompt dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedFile {
    pub path: String,
    pub content: String,
    pub truncated: bool,
}

/// Everything one run has learned so far.
///
/// Owned by exactly one run; the orchestrator mutates it between steps and
/// dispatchers only read it.
#[derive(Debug, Default)]
pub struct Accumulator {
    fetched_files: Vec<FetchedFile>,
    fetched_index: HashSet<String>,
    referenced_commits: Vec<String>,
    commit_details: Vec<CommitEvidence>,
    progress_log: Vec<String>,
    step_history: Vec<StepResult>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetched_files(&self) -> &[FetchedFile] {
        &self.fetched_files
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.fetched_index.contains(path)
    }

    pub fn referenced_commits(&self) -> &[String] {
        &self.referenced_commits
    }

    pub fn commit_details(&self) -> &[CommitEvidence] {
        &self.commit_details
    }

    pub fn has_commit_detail(&self, sha: &str) -> bool {
        self.commit_details.iter().any(|c| c.sha == sha)
    }

    pub fn progress_log(&self) -> &[String] {
        &self.progress_log
    }

    pub fn step_history(&self) -> &[StepResult] {
        &self.step_history
    }

    pub fn last_step(&self) -> Option<&StepResult> {
        self.step_history.last()
    }

    /// Record a file. The first content seen for a path wins.
    /// Returns whether the file was new.
    pub fn add_file(&mut self, file: FetchedFile) -> bool {
        if !self.fetched_index.insert(file.path.clone()) {
            return false;
        }
        self.fetched_files.push(file);
        true
    }

    /// Merge the successful entries of a fetch batch; returns how many were new.
    pub fn merge_fetch_results(&mut self, results: &[FetchResult]) -> usize {
        results
            .iter()
            .filter_map(|r| {
                r.content.as_ref().map(|content| FetchedFile {
                    path: r.path.clone(),
                    content: content.clone(),
                    truncated: r.truncated,
                })
            })
            .filter(|file| self.add_file(file.clone()))
            .count()
    }

    /// Append commit ids not seen before; returns the newly added ones.
    pub fn reference_commits(&mut self, shas: &[String]) -> Vec<String> {
        let mut added = Vec::new();
        for sha in shas {
            if !self.referenced_commits.contains(sha) {
                self.referenced_commits.push(sha.clone());
                added.push(sha.clone());
            }
        }
        added
    }

    pub fn add_commit_detail(&mut self, detail: CommitEvidence) {
        if !self.has_commit_detail(&detail.sha) {
            self.commit_details.push(detail);
        }
    }

    /// Append to the run's progress log and mirror it to tracing.
    pub fn notice(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "pmscope::progress", "{}", message);
        self.progress_log.push(message);
    }

    pub fn push_step(&mut self, step: StepResult) {
        self.step_history.push(step);
    }

    pub fn fetched_paths(&self) -> Vec<String> {
        self.fetched_files.iter().map(|f| f.path.clone()).collect()
    }

    /// Consume the accumulator, keeping what the final result reports.
    pub fn into_parts(self) -> (Vec<StepResult>, Vec<String>, Vec<String>, Vec<String>) {
        let paths = self.fetched_paths();
        (
            self.step_history,
            self.progress_log,
            paths,
            self.referenced_commits,
        )
    }
}
