//! Wiring shared by the commands: config, provider, stores, engine.

use anyhow::{Context, anyhow};
use std::sync::Arc;
use tracing::{debug, info};
use turnkeep_config::AppConfig;
use turnkeep_core::session::SessionStore;
use turnkeep_engine::TurnEngine;
use turnkeep_store::{InMemorySessionStore, SqliteSessionStore};
use turnkeep_tools::{CollectionSchema, FieldKind, InMemoryDatastore};

pub fn load_config() -> anyhow::Result<AppConfig> {
    AppConfig::load().context("Failed to load config")
}

pub async fn session_store(config: &AppConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
    match config.store.backend.as_str() {
        "memory" => {
            info!("Using in-memory session store; sessions end with the process");
            Ok(Arc::new(InMemorySessionStore::new()))
        }
        _ => {
            let path = config.store.resolved_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            debug!(path = %path.display(), "Opening SQLite session store");
            let store = SqliteSessionStore::new(&path.to_string_lossy())
                .await
                .with_context(|| format!("Failed to open session store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

/// Kitchen collections for local use. Records live only as long as the
/// process.
pub fn sample_datastore() -> InMemoryDatastore {
    InMemoryDatastore::new(vec![
        CollectionSchema::new("pantry")
            .with_field("name", FieldKind::Text, true)
            .with_field("quantity", FieldKind::Number, false)
            .with_field("unit", FieldKind::Text, false)
            .with_field("expires", FieldKind::Date, false),
        CollectionSchema::new("recipes")
            .with_field("name", FieldKind::Text, true)
            .with_field("ingredients", FieldKind::List, false)
            .with_field("cuisine", FieldKind::Text, false)
            .with_field("minutes", FieldKind::Number, false),
        CollectionSchema::new("meal_plans")
            .with_field("date", FieldKind::Date, true)
            .with_field("recipe", FieldKind::Reference, false)
            .with_field("servings", FieldKind::Number, false),
        CollectionSchema::new("shopping_list")
            .with_field("name", FieldKind::Text, true)
            .with_field("quantity", FieldKind::Number, false)
            .with_field("done", FieldKind::Bool, false),
    ])
}

pub async fn build_engine(config: AppConfig) -> anyhow::Result<Arc<TurnEngine>> {
    let provider = turnkeep_providers::build_from_config(&config)
        .default()
        .map_err(|e| {
            anyhow!(
                "{e}. Set TURNKEEP_API_KEY or OPENAI_API_KEY, or add api_key to {}",
                AppConfig::config_dir().join("config.toml").display()
            )
        })?;
    let store = session_store(&config).await?;
    Ok(Arc::new(TurnEngine::new(
        Arc::new(config),
        provider,
        Arc::new(sample_datastore()),
        store,
    )))
}
