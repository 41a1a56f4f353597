// Configuration management for the torshare CLI
//
// Cross-platform config stored in:
// - macOS/Linux: ~/.config/torshare/config.json
// - Windows: %APPDATA%\torshare\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Rendezvous server address (an onion host:port when proxied)
    pub relay_server: String,

    /// Local SOCKS5 proxy for reaching the relay; None dials directly
    pub socks_proxy: Option<String>,

    /// Destination directory for received files; defaults to
    /// <downloads>/torshare when unset
    pub download_dir: Option<PathBuf>,

    /// Seconds between peer discovery refreshes
    pub discovery_interval_secs: u64,

    /// Pre-hash outgoing files and verify incoming ones
    pub verify_hashes: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            relay_server: "127.0.0.1:3000".to_string(),
            socks_proxy: Some("127.0.0.1:9050".to_string()),
            download_dir: None,
            discovery_interval_secs: 5,
            verify_hashes: true,
        }
    }
}

impl CliConfig {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("torshare");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: CliConfig =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = CliConfig::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// The effective download directory
    pub fn effective_download_dir(&self) -> PathBuf {
        match &self.download_dir {
            Some(dir) => dir.clone(),
            None => dirs::download_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("torshare"),
        }
    }

    /// Set a config value by key; returns an error for unknown keys
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "relay_server" => self.relay_server = value.to_string(),
            "socks_proxy" => {
                self.socks_proxy = if value.is_empty() || value == "none" {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "download_dir" => {
                self.download_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "discovery_interval_secs" => {
                self.discovery_interval_secs =
                    value.parse().context("Expected a number of seconds")?
            }
            "verify_hashes" => {
                self.verify_hashes = value.parse().context("Expected true or false")?
            }
            other => anyhow::bail!("Unknown config key: {}", other),
        }
        Ok(())
    }

    /// Get a config value by key
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "relay_server" => self.relay_server.clone(),
            "socks_proxy" => self.socks_proxy.clone().unwrap_or_else(|| "none".into()),
            "download_dir" => self.effective_download_dir().display().to_string(),
            "discovery_interval_secs" => self.discovery_interval_secs.to_string(),
            "verify_hashes" => self.verify_hashes.to_string(),
            other => anyhow::bail!("Unknown config key: {}", other),
        };
        Ok(value)
    }
}
