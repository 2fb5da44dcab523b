mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    // Try default locations
    let default_paths = [
        "./config.toml",
        "./tivoserve.toml",
        "~/.config/tivoserve/config.toml",
        "/etc/tivoserve/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if config.streaming.max_sessions == 0 {
        anyhow::bail!("streaming.max_sessions must be at least 1");
    }

    let mut names: Vec<&str> = config.shares.iter().map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    if names.len() != config.shares.len() {
        anyhow::bail!("Share names must be unique");
    }

    for share in &config.shares {
        if share.name.is_empty() {
            anyhow::bail!("Share name cannot be empty");
        }
        if !share.path.exists() {
            tracing::warn!("Share path does not exist: {:?}", share.path);
        }
    }

    if config.device.video_codecs.is_empty() {
        anyhow::bail!("Device capability matrix must list at least one video codec");
    }
    if config.device.display_aspect_ratios.is_empty() {
        anyhow::bail!("Device capability matrix must list at least one display aspect ratio");
    }

    Ok(())
}
