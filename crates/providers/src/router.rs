//! Builds completion backends from `[providers.*]` config and picks the
//! default one.

use crate::openai_compat::{OpenAiCompatProvider, RetryPolicy};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use turnkeep_config::{AppConfig, ProviderConfig};
use turnkeep_core::error::ProviderError;
use turnkeep_core::provider::Provider;

/// A backend the router knows how to reach without an `api_url`.
struct KnownBackend {
    name: &'static str,
    url: &'static str,
    /// Local servers accept any key
    hosted: bool,
}

const KNOWN_BACKENDS: &[KnownBackend] = &[
    KnownBackend { name: "openai", url: "https://api.openai.com/v1", hosted: true },
    KnownBackend { name: "openrouter", url: "https://openrouter.ai/api/v1", hosted: true },
    KnownBackend { name: "groq", url: "https://api.groq.com/openai/v1", hosted: true },
    KnownBackend { name: "together", url: "https://api.together.xyz/v1", hosted: true },
    KnownBackend { name: "ollama", url: "http://localhost:11434/v1", hosted: false },
    KnownBackend { name: "vllm", url: "http://localhost:8000/v1", hosted: false },
    KnownBackend { name: "llamacpp", url: "http://localhost:8080/v1", hosted: false },
];

fn known(name: &str) -> Option<&'static KnownBackend> {
    let name = if name == "llama.cpp" { "llamacpp" } else { name };
    KNOWN_BACKENDS.iter().find(|b| b.name == name)
}

/// Configured backends, by name. Backends that could not be built are
/// kept with the reason so asking for one explains itself.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    unavailable: BTreeMap<String, String>,
    default_provider: String,
}

impl ProviderRouter {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            unavailable: BTreeMap::new(),
            default_provider: default_provider.into(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let name = name.into();
        self.unavailable.remove(&name);
        self.providers.insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        if let Some(provider) = self.providers.get(name) {
            return Ok(provider.clone());
        }
        let reason = self
            .unavailable
            .get(name)
            .cloned()
            .unwrap_or_else(|| format!("no backend named '{name}'"));
        Err(ProviderError::NotConfigured(reason))
    }

    /// The backend named by `default_provider`.
    pub fn default(&self) -> Result<Arc<dyn Provider>, ProviderError> {
        self.get(&self.default_provider)
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Build one backend. The per-backend key wins over the top-level one;
/// hosted backends without any key are refused.
fn build_backend(
    name: &str,
    settings: &ProviderConfig,
    config: &AppConfig,
) -> Result<OpenAiCompatProvider, String> {
    let backend = known(name);
    let url = settings
        .api_url
        .clone()
        .or_else(|| backend.map(|b| b.url.to_string()))
        .ok_or_else(|| format!("'{name}' is not a known backend and has no api_url"))?;

    let key = settings.api_key.clone().or_else(|| config.api_key.clone());
    // A custom api_url may be a local server, so only refuse well-known hosted ones
    let hosted = backend.is_some_and(|b| b.hosted) && settings.api_url.is_none();
    let key = match key {
        Some(key) => key,
        None if hosted => return Err(format!("'{name}' has no API key")),
        None => String::new(),
    };

    let defaults = RetryPolicy::default();
    let mut provider = OpenAiCompatProvider::new(name, url, key).with_retry(RetryPolicy {
        max_retries: settings.max_retries.unwrap_or(defaults.max_retries),
        ..defaults
    });
    if let Some(secs) = settings.timeout_secs {
        provider = provider.with_timeout(Duration::from_secs(secs));
    }
    if let Some(json_mode) = settings.json_mode {
        provider = provider.with_json_mode(json_mode);
    }
    Ok(provider)
}

/// Build every configured backend, plus the default one when it has no
/// `[providers.*]` table of its own.
pub fn build_from_config(config: &AppConfig) -> ProviderRouter {
    let mut router = ProviderRouter::new(&config.default_provider);

    let implicit = ProviderConfig::default();
    let mut wanted: Vec<(&str, &ProviderConfig)> = config
        .providers
        .iter()
        .map(|(name, settings)| (name.as_str(), settings))
        .collect();
    if !config.providers.contains_key(&config.default_provider) {
        wanted.push((config.default_provider.as_str(), &implicit));
    }

    for (name, settings) in wanted {
        match build_backend(name, settings, config) {
            Ok(provider) => {
                debug!(provider = name, url = provider.base_url(), "Completion backend ready");
                router.register(name, Arc::new(provider));
            }
            Err(reason) => {
                warn!(provider = name, %reason, "Completion backend unavailable");
                router.unavailable.insert(name.to_string(), reason);
            }
        }
    }

    router
}
