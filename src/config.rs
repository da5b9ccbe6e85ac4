//! Configuration for verifact.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VERIFACT_HOME, VERIFACT_FALLBACK_MODELS,
//!    VERIFACT_<ROLE>_FALLBACK_MODELS, VERIFACT_CACHE_ENABLED,
//!    VERIFACT_RATE_LIMIT_ENABLED)
//! 2. Config file (.verifact/config.yaml)
//! 3. Defaults (~/.verifact)
//!
//! Config file discovery:
//! - Searches current directory and parents for .verifact/config.yaml
//! - `paths.home` in the config file is relative to the .verifact/ directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::Parameters;
use crate::agents::AgentRole;
use crate::core::cache::CacheSettings;
use crate::core::orchestrator::PipelineConfig;
use crate::core::rate_limiter::RateLimitSettings;
use crate::core::retry::RetryPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Model appended to every fallback chain
pub const DEFAULT_FALLBACK_MODEL: &str = "meta-llama/llama-3.3-8b-instruct:free";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub models: ModelSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to the .verifact/ directory)
    pub home: Option<String>,
}

/// Model selection and call defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// OpenAI-compatible chat completions URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_claim_detector")]
    pub claim_detector: String,

    #[serde(default = "default_evidence_hunter")]
    pub evidence_hunter: String,

    #[serde(default = "default_verdict_writer")]
    pub verdict_writer: String,

    /// Fallbacks tried after one role's primary model
    #[serde(default)]
    pub role_fallbacks: HashMap<AgentRole, Vec<String>>,

    /// Fallbacks tried after the role fallbacks
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Always tried last
    #[serde(default = "default_fallback")]
    pub default_fallback: String,

    #[serde(default)]
    pub parameters: Parameters,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}
fn default_claim_detector() -> String {
    "qwen/qwen3-8b:free".to_string()
}
fn default_evidence_hunter() -> String {
    "google/gemma-3-27b-it:free".to_string()
}
fn default_verdict_writer() -> String {
    "deepseek/deepseek-chat:free".to_string()
}
fn default_fallback() -> String {
    DEFAULT_FALLBACK_MODEL.to_string()
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            claim_detector: default_claim_detector(),
            evidence_hunter: default_evidence_hunter(),
            verdict_writer: default_verdict_writer(),
            role_fallbacks: HashMap::new(),
            fallbacks: Vec::new(),
            default_fallback: default_fallback(),
            parameters: Parameters::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ModelSettings {
    pub fn primary(&self, role: AgentRole) -> &str {
        match role {
            AgentRole::ClaimDetector => &self.claim_detector,
            AgentRole::EvidenceHunter => &self.evidence_hunter,
            AgentRole::VerdictWriter => &self.verdict_writer,
        }
    }

    /// Ordered models for one role: primary, role fallbacks, general
    /// fallbacks, then the default fallback. Each model appears once.
    pub fn chain_for(&self, role: AgentRole) -> Vec<String> {
        let role_fallbacks = self.role_fallbacks.get(&role).into_iter().flatten();
        let candidates = std::iter::once(self.primary(role))
            .chain(role_fallbacks.map(String::as_str))
            .chain(self.fallbacks.iter().map(String::as_str))
            .chain(std::iter::once(self.default_fallback.as_str()));

        let mut chain: Vec<String> = Vec::new();
        for model in candidates {
            let model = model.trim();
            if !model.is_empty() && !chain.iter().any(|m| m == model) {
                chain.push(model.to_string());
            }
        }
        chain
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to verifact home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub models: ModelSettings,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
    pub pipeline: PipelineConfig,
}

impl ResolvedConfig {
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn cache_db(&self) -> PathBuf {
        self.home.join("cache.db")
    }

    /// Overlay environment variables read through `lookup`
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(home) = lookup("VERIFACT_HOME") {
            self.home = PathBuf::from(home);
        }
        if let Some(models) = lookup("VERIFACT_FALLBACK_MODELS") {
            self.models.fallbacks = split_models(&models);
        }
        for role in [
            AgentRole::ClaimDetector,
            AgentRole::EvidenceHunter,
            AgentRole::VerdictWriter,
        ] {
            let var = format!("VERIFACT_{}_FALLBACK_MODELS", role.as_str().to_uppercase());
            if let Some(models) = lookup(&var) {
                self.models.role_fallbacks.insert(role, split_models(&models));
            }
        }
        if let Some(enabled) = lookup("VERIFACT_CACHE_ENABLED").as_deref().and_then(parse_flag) {
            self.cache.enabled = enabled;
        }
        if let Some(enabled) = lookup("VERIFACT_RATE_LIMIT_ENABLED")
            .as_deref()
            .and_then(parse_flag)
        {
            self.rate_limit.enabled = enabled;
        }
    }
}

fn split_models(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".verifact").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Build the resolved config from an optional config file
fn resolve(config_file: Option<PathBuf>, file: ConfigFile, default_home: PathBuf) -> ResolvedConfig {
    let home = match (&config_file, &file.paths.home) {
        (Some(config_path), Some(home_path)) => {
            let verifact_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(verifact_dir, home_path)
        }
        _ => default_home,
    };

    ResolvedConfig {
        home,
        config_file,
        models: file.models,
        cache: file.cache,
        rate_limit: file.rate_limit,
        pipeline: file.pipeline,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".verifact");

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let mut resolved = resolve(config_file, file, default_home);
    resolved.apply_env(|name| std::env::var(name).ok());
    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the verifact home directory (engine state)
pub fn verifact_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($VERIFACT_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}
