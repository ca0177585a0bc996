//! Typed failure categories surfaced by the orchestration core.
//!
//! Most internals propagate `anyhow::Error`; these variants exist for the
//! places where callers need to tell failure kinds apart (for example to
//! decide whether a step can be retried or must end the run).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// The repository URL does not point at a GitHub owner/repo pair
    #[error("not a GitHub repository URL: {0}")]
    InvalidRepoUrl(String),

    /// Network failure or timeout talking to the oracle or the remote host
    #[error("transport error: {0}")]
    Transport(String),

    /// Oracle text did not contain an extractable JSON object
    #[error("malformed structured output: {0}")]
    MalformedOutput(String),

    /// The contents endpoint returned something other than a regular file
    #[error("'{path}' is not a file (type: {kind})")]
    NotAFile { path: String, kind: String },

    /// Remote API answered with a non-success status
    #[error("remote API error ({status}): {message}")]
    Remote {
        status: u16,
        message: String,
        /// Quota the remote reported on the failing response, if any
        quota_remaining: Option<u32>,
    },
}

impl AgentError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedOutput(msg.into())
    }

    /// Remaining quota carried by a refused remote request.
    pub fn quota_remaining(&self) -> Option<u32> {
        match self {
            Self::Remote {
                quota_remaining, ..
            } => *quota_remaining,
            _ => None,
        }
    }
}
