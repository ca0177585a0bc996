//! pmscope library crate
//!
//! Multi-step project analysis: an oracle-driven loop that gathers evidence
//! from a GitHub repository until its answer is confident enough.

pub mod agent;
pub mod config;
pub mod error;
pub mod github;
pub mod keyring;
pub mod logging;

#[cfg(test)]
pub(crate) mod test_support;
