//! Configuration loading, validation, and management for Turnkeep.
//!
//! Loads configuration from `~/.turnkeep/config.toml` with environment
//! variable overrides. Every numeric threshold the engine uses (windows,
//! caps, compression trigger) is policy and lives here, not in code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use turnkeep_core::plan::{Complexity, StepType};

/// Name of the full orchestration mode. Anything else is a bypass mode.
pub const PIPELINE_MODE: &str = "pipeline";

/// The root configuration structure.
///
/// Maps directly to `~/.turnkeep/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Model used by any tier that does not name its own
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Orchestration engine policy
    #[serde(default)]
    pub engine: EngineConfig,

    /// Session storage
    #[serde(default)]
    pub store: StoreConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("engine", &self.engine)
            .field("store", &self.store)
            .field("gateway", &self.gateway)
            .field("providers", &self.providers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("max_retries", &self.max_retries)
            .field("timeout_secs", &self.timeout_secs)
            .field("json_mode", &self.json_mode)
            .finish()
    }
}

/// Settings for one completion backend under `[providers.<name>]`.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Overrides the top-level `api_key` for this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Required for backends without a well-known endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Extra attempts after a rate limit, 5xx or network failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Whether the backend accepts `response_format: json_object`.
    /// Structured stages still parse and repair replies without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_mode: Option<bool>,
}

// ── Engine ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub limits: LoopLimits,

    #[serde(default)]
    pub tiers: TiersConfig,

    /// Which tier each fixed pipeline stage runs on
    #[serde(default)]
    pub stages: StageTiers,

    /// Complexity assumed for a step when the planner leaves it out
    #[serde(default)]
    pub complexity_rules: ComplexityRules,

    #[serde(default = "default_subdomains")]
    pub subdomains: Vec<SubdomainConfig>,

    /// Collection name → entity type. Unlisted collections use the
    /// collection name with a trailing `s` dropped.
    #[serde(default)]
    pub entity_types: HashMap<String, String>,

    /// Bypass modes that stream raw completions
    #[serde(default = "default_modes")]
    pub modes: Vec<ModeConfig>,
}

/// How many items of each kind stay verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Conversation turns kept verbatim (M)
    #[serde(default = "default_conversation_window")]
    pub conversation_window: usize,

    /// Turn execution summaries kept in full (K)
    #[serde(default = "default_reasoning_window")]
    pub reasoning_window: usize,

    /// Step results kept untouched by mid-execution compression
    #[serde(default = "default_step_result_window")]
    pub step_result_window: usize,

    /// Turns an unretained entity stays in the active working set
    #[serde(default = "default_entity_window")]
    pub entity_active_window: u32,
}

fn default_conversation_window() -> usize {
    3
}
fn default_reasoning_window() -> usize {
    2
}
fn default_step_result_window() -> usize {
    2
}
fn default_entity_window() -> u32 {
    3
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            conversation_window: default_conversation_window(),
            reasoning_window: default_reasoning_window(),
            step_result_window: default_step_result_window(),
            entity_active_window: default_entity_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Estimated tokens of execution context above which older step
    /// results are summarized
    #[serde(default = "default_context_threshold")]
    pub context_token_threshold: usize,

    /// Sample ids kept per summarized step result
    #[serde(default = "default_sample_ids")]
    pub sample_ids: usize,

    /// Token cap for each one-sentence history fold
    #[serde(default = "default_fold_max_tokens")]
    pub fold_max_tokens: u32,
}

fn default_context_threshold() -> usize {
    6000
}
fn default_sample_ids() -> usize {
    3
}
fn default_fold_max_tokens() -> u32 {
    80
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            context_token_threshold: default_context_threshold(),
            sample_ids: default_sample_ids(),
            fold_max_tokens: default_fold_max_tokens(),
        }
    }
}

/// Hard caps that keep the plan/execute loop finite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopLimits {
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls_per_step: usize,

    #[serde(default = "default_max_schema_requests")]
    pub max_schema_requests_per_step: usize,

    /// Re-asks allowed per model call when the output does not parse
    #[serde(default = "default_max_parse_repairs")]
    pub max_parse_repairs: usize,

    #[serde(default = "default_max_replans")]
    pub max_replans_per_turn: usize,

    #[serde(default = "default_max_steps")]
    pub max_steps_per_plan: usize,
}

fn default_max_tool_calls() -> usize {
    6
}
fn default_max_schema_requests() -> usize {
    2
}
fn default_max_parse_repairs() -> usize {
    2
}
fn default_max_replans() -> usize {
    2
}
fn default_max_steps() -> usize {
    8
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_tool_calls_per_step: default_max_tool_calls(),
            max_schema_requests_per_step: default_max_schema_requests(),
            max_parse_repairs: default_max_parse_repairs(),
            max_replans_per_turn: default_max_replans(),
            max_steps_per_plan: default_max_steps(),
        }
    }
}

/// Model settings for one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Falls back to `default_model` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,

    #[serde(default = "default_tier_temperature")]
    pub temperature: f32,

    #[serde(default = "default_tier_max_tokens")]
    pub max_tokens: u32,
}

fn default_tier_temperature() -> f32 {
    0.3
}
fn default_tier_max_tokens() -> u32 {
    1024
}

impl TierConfig {
    fn with_effort(effort: &str, max_tokens: u32) -> Self {
        Self {
            model: None,
            reasoning_effort: Some(effort.into()),
            temperature: default_tier_temperature(),
            max_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    #[serde(default = "default_low_tier")]
    pub low: TierConfig,
    #[serde(default = "default_medium_tier")]
    pub medium: TierConfig,
    #[serde(default = "default_high_tier")]
    pub high: TierConfig,
}

fn default_low_tier() -> TierConfig {
    TierConfig::with_effort("low", 1024)
}
fn default_medium_tier() -> TierConfig {
    TierConfig::with_effort("medium", 2048)
}
fn default_high_tier() -> TierConfig {
    TierConfig::with_effort("high", 4096)
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            low: default_low_tier(),
            medium: default_medium_tier(),
            high: default_high_tier(),
        }
    }
}

impl TiersConfig {
    pub fn for_complexity(&self, complexity: Complexity) -> &TierConfig {
        match complexity {
            Complexity::Low => &self.low,
            Complexity::Medium => &self.medium,
            Complexity::High => &self.high,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiers {
    #[serde(default = "low")]
    pub route: Complexity,
    #[serde(default = "low")]
    pub understand: Complexity,
    #[serde(default = "medium")]
    pub plan: Complexity,
    #[serde(default = "medium")]
    pub reply: Complexity,
    #[serde(default = "low")]
    pub summarize: Complexity,
}

fn low() -> Complexity {
    Complexity::Low
}
fn medium() -> Complexity {
    Complexity::Medium
}
fn high() -> Complexity {
    Complexity::High
}

impl Default for StageTiers {
    fn default() -> Self {
        Self {
            route: low(),
            understand: low(),
            plan: medium(),
            reply: medium(),
            summarize: low(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityRules {
    #[serde(default = "low")]
    pub read: Complexity,
    #[serde(default = "medium")]
    pub write: Complexity,
    #[serde(default = "medium")]
    pub analyze: Complexity,
    #[serde(default = "high")]
    pub generate: Complexity,
}

impl Default for ComplexityRules {
    fn default() -> Self {
        Self {
            read: low(),
            write: medium(),
            analyze: medium(),
            generate: high(),
        }
    }
}

impl ComplexityRules {
    pub fn for_step(&self, step_type: StepType) -> Complexity {
        match step_type {
            StepType::Read => self.read,
            StepType::Write => self.write,
            StepType::Analyze => self.analyze,
            StepType::Generate => self.generate,
        }
    }
}

/// A slice of the domain a step can be scoped to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdomainConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Collections steps in this subdomain may touch. Empty means all.
    #[serde(default)]
    pub collections: Vec<String>,
}

fn default_subdomains() -> Vec<SubdomainConfig> {
    vec![SubdomainConfig {
        name: "general".into(),
        description: "Anything not covered by a narrower subdomain".into(),
        collections: vec![],
    }]
}

/// A bypass mode: raw streamed completions under its own instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    pub name: String,

    #[serde(default)]
    pub instructions: String,

    #[serde(default = "medium")]
    pub tier: Complexity,
}

fn default_modes() -> Vec<ModeConfig> {
    vec![ModeConfig {
        name: "freeform".into(),
        instructions: "Talk with the user freely. No records are read or changed in this mode."
            .into(),
        tier: medium(),
    }]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention: RetentionConfig::default(),
            compression: CompressionConfig::default(),
            limits: LoopLimits::default(),
            tiers: TiersConfig::default(),
            stages: StageTiers::default(),
            complexity_rules: ComplexityRules::default(),
            subdomains: default_subdomains(),
            entity_types: HashMap::new(),
            modes: default_modes(),
        }
    }
}

impl EngineConfig {
    /// Entity type used for records of `collection`.
    pub fn entity_type_for(&self, collection: &str) -> String {
        if let Some(mapped) = self.entity_types.get(collection) {
            return mapped.clone();
        }
        collection
            .strip_suffix('s')
            .filter(|s| !s.is_empty())
            .unwrap_or(collection)
            .to_string()
    }

    pub fn subdomain(&self, name: &str) -> Option<&SubdomainConfig> {
        self.subdomains.iter().find(|s| s.name == name)
    }

    /// The subdomain unknown or missing names fall back to.
    pub fn default_subdomain(&self) -> &str {
        self.subdomains
            .first()
            .map(|s| s.name.as_str())
            .unwrap_or("general")
    }

    pub fn mode(&self, name: &str) -> Option<&ModeConfig> {
        self.modes.iter().find(|m| m.name == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.retention;
        if r.conversation_window == 0 || r.reasoning_window == 0 || r.step_result_window == 0 {
            return Err(ConfigError::ValidationError(
                "retention windows must be at least 1".into(),
            ));
        }
        if r.entity_active_window == 0 {
            return Err(ConfigError::ValidationError(
                "entity_active_window must be at least 1".into(),
            ));
        }

        let l = &self.limits;
        if l.max_tool_calls_per_step == 0 || l.max_steps_per_plan == 0 {
            return Err(ConfigError::ValidationError(
                "max_tool_calls_per_step and max_steps_per_plan must be at least 1".into(),
            ));
        }

        for (name, tier) in [
            ("low", &self.tiers.low),
            ("medium", &self.tiers.medium),
            ("high", &self.tiers.high),
        ] {
            if !(0.0..=2.0).contains(&tier.temperature) {
                return Err(ConfigError::ValidationError(format!(
                    "tiers.{name}.temperature must be between 0.0 and 2.0"
                )));
            }
        }

        if self.subdomains.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one subdomain must be configured".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for sub in &self.subdomains {
            if sub.name.trim().is_empty() || !seen.insert(sub.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "subdomain names must be non-empty and unique (got '{}')",
                    sub.name
                )));
            }
        }

        for mode in &self.modes {
            if mode.name == PIPELINE_MODE {
                return Err(ConfigError::ValidationError(format!(
                    "'{PIPELINE_MODE}' is reserved and cannot be a bypass mode"
                )));
            }
        }
        Ok(())
    }
}

// ── Store & gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// SQLite database file; defaults to `~/.turnkeep/sessions.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_store_backend() -> String {
    "sqlite".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("sessions.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Seconds between keep-alive pings on idle event streams
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Reject binding to a non-loopback address unless set
    #[serde(default)]
    pub allow_public_bind: bool,

    /// Queue results and errors of detached turns for the next reconnect
    #[serde(default = "default_true")]
    pub queue_undelivered: bool,

    /// Browser origins allowed to call the API. Empty means same-origin only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_keep_alive() -> u64 {
    15
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            keep_alive_secs: default_keep_alive(),
            allow_public_bind: false,
            queue_undelivered: true,
            cors_origins: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.turnkeep/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `TURNKEEP_API_KEY` (highest priority)
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("TURNKEEP_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("TURNKEEP_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("TURNKEEP_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".turnkeep")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.store.backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "unknown store backend '{}'",
                self.store.backend
            )));
        }
        self.engine.validate()
    }

    /// Model for a tier, falling back to the global default.
    pub fn model_for(&self, tier: &TierConfig) -> String {
        tier.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
            providers: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
