//! Configuration management for pmscope
//!
//! Stores settings in ~/.config/pmscope/config.json. Credentials never live in
//! this file; they come from the environment or the system keychain.

use crate::agent::{AgentKind, HeuristicFiles};
use crate::keyring;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";
pub const DEFAULT_MAX_STEPS: usize = 10;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 10;
pub const DEFAULT_MAX_FILES_PER_CALL: usize = 50;
pub const DEFAULT_DIRECTORY_DEPTH: usize = 1;
pub const DEFAULT_MAX_LINES_PER_FILE: usize = 500;
pub const DEFAULT_MAX_LISTED_FILES: usize = 100;
pub const DEFAULT_QUOTA_LOW_WATER: u32 = 100;
pub const DEFAULT_ORACLE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Upper bound on `max_steps`; each step costs two oracle calls.
const MAX_STEPS_CEILING: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OpenRouter model id used for every oracle call
    pub model: String,
    pub max_steps: usize,
    pub fetch_concurrency: usize,
    pub max_files_per_call: usize,
    pub directory_depth: usize,
    /// Lines kept per fetched file; 0 keeps everything
    pub max_lines_per_file: usize,
    pub max_listed_files: usize,
    /// Remaining GitHub quota below which a warning is logged
    pub quota_low_water: u32,
    pub oracle_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Per-agent replacement for the built-in fallback evidence
    pub fallback_files: HashMap<AgentKind, HeuristicFiles>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            max_files_per_call: DEFAULT_MAX_FILES_PER_CALL,
            directory_depth: DEFAULT_DIRECTORY_DEPTH,
            max_lines_per_file: DEFAULT_MAX_LINES_PER_FILE,
            max_listed_files: DEFAULT_MAX_LISTED_FILES,
            quota_low_water: DEFAULT_QUOTA_LOW_WATER,
            oracle_timeout_secs: DEFAULT_ORACLE_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            fallback_files: HashMap::new(),
        }
    }
}

/// Validated knobs for one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub max_steps: usize,
    pub fetch_concurrency: usize,
    pub max_files_per_call: usize,
    pub directory_depth: usize,
    pub max_lines_per_file: usize,
    pub max_listed_files: usize,
    pub quota_low_water: u32,
    pub oracle_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Config::default().orchestrator()
    }
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("pmscope"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk with environment overrides applied
    pub fn load() -> Self {
        let mut config = match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        };
        config.apply_env_overrides();
        config
    }

    /// Load config from a specific file. Missing files give defaults; corrupt
    /// files are moved aside and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Config>(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    "config file {} was corrupted ({}); a backup was saved and defaults were loaded",
                    path.display(),
                    err
                );
                Self::default()
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(steps) = std::env::var("PMSCOPE_MAX_STEPS")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
        {
            self.max_steps = steps;
        }
        if let Ok(model) = std::env::var("PMSCOPE_MODEL") {
            if !model.trim().is_empty() {
                self.model = model.trim().to_string();
            }
        }
    }

    /// Persist a new default model. Environment overrides stay out of the file.
    pub fn set_model(model: &str) -> Result<(), String> {
        let path =
            Self::config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
        Self::set_model_at(&path, model)
    }

    fn set_model_at(path: &Path, model: &str) -> Result<(), String> {
        let mut config = Self::load_from(path);
        config.model = model.trim().to_string();
        config.save_to(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        write_config_atomic(path, &content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/pmscope/config.json".to_string())
    }

    /// Get the OpenRouter API key (environment first, then keychain)
    pub fn get_api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }
        match keyring::get_api_key() {
            Ok(key) => key,
            Err(err) => {
                keyring::warn_keychain_error_once("OpenRouter API key", &err);
                None
            }
        }
    }

    /// Get the GitHub token (environment first, then keychain)
    pub fn get_github_token(&self) -> Option<String> {
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.trim().is_empty() {
                return Some(token);
            }
        }
        match keyring::get_github_token() {
            Ok(token) => token,
            Err(err) => {
                keyring::warn_keychain_error_once("GitHub token", &err);
                None
            }
        }
    }

    /// Clamp raw settings into a config the orchestrator can rely on.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_steps: self.max_steps.clamp(1, MAX_STEPS_CEILING),
            fetch_concurrency: self.fetch_concurrency.max(1),
            max_files_per_call: self.max_files_per_call.max(1),
            directory_depth: self.directory_depth,
            max_lines_per_file: self.max_lines_per_file,
            max_listed_files: self.max_listed_files.max(1),
            quota_low_water: self.quota_low_water,
            oracle_timeout: Duration::from_secs(self.oracle_timeout_secs.max(1)),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
        }
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            warn!("failed to set config file permissions: {}", e);
        }
    }

    file.write_all(content.as_bytes())?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
