//! `turnkeep config`: configuration management.

use anyhow::Context;
use std::path::Path;
use turnkeep_config::AppConfig;

/// Write the default config to `path`. Returns `false` when a file was
/// already there and `force` was not given.
fn write_default(path: &Path, force: bool) -> anyhow::Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

pub fn init(force: bool) -> anyhow::Result<()> {
    let path = AppConfig::config_dir().join("config.toml");
    if write_default(&path, force)? {
        println!("Wrote default config to {}", path.display());
        println!("   Set TURNKEEP_API_KEY or OPENAI_API_KEY, or add api_key to the file.");
    } else {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Ok(())
}

pub fn show() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_loadable_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".turnkeep").join("config.toml");

        assert!(write_default(&path, false).unwrap());
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.default_model, AppConfig::default().default_model);

        std::fs::write(&path, "default_model = \"mine\"\n").unwrap();
        assert!(!write_default(&path, false).unwrap());
        assert_eq!(AppConfig::load_from(&path).unwrap().default_model, "mine");

        assert!(write_default(&path, true).unwrap());
        assert_ne!(AppConfig::load_from(&path).unwrap().default_model, "mine");
    }
}
