//! Server configuration types
//!
//! TOML file for tunables, environment for secrets. Missing file means
//! defaults; missing gateway token is a startup error.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use warden_core::CoreConfig;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    "sqlite:warden.db?mode=rwc".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

/// Sandbox provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_image() -> String {
    "warden-sandbox".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_port_range_start() -> u16 {
    30000
}
fn default_port_range_end() -> u16 {
    35000
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_ready_timeout_secs() -> u64 {
    60
}
fn default_turn_timeout_secs() -> u64 {
    120
}
fn default_idle_timeout_secs() -> u64 {
    1800
}
fn default_queue_depth() -> usize {
    3
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            data_dir: default_data_dir(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            connect_timeout_secs: default_connect_timeout_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
            turn_timeout_secs: default_turn_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Messaging-channel adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    /// Base URL of the outbound delivery webhook. Empty means log-only.
    #[serde(default)]
    pub outbound_url: String,
}

impl AppConfig {
    /// Load from `$WARDEN_CONFIG` (or `config/warden.toml`), falling back to
    /// defaults when no file exists.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| "config/warden.toml".to_string());
        if Path::new(&path).exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path))?;
            toml::from_str(&raw).with_context(|| format!("Failed to parse config file {}", path))
        } else {
            Ok(Self::default())
        }
    }

    /// The shared gateway secret. Required.
    pub fn gateway_token() -> Result<SecretString> {
        let token =
            std::env::var("WARDEN_GATEWAY_TOKEN").context("WARDEN_GATEWAY_TOKEN must be set")?;
        Ok(SecretString::from(token))
    }

    /// The credential-provisioning key, when per-sandbox provider keys are
    /// enabled.
    pub fn provisioning_key() -> Option<SecretString> {
        std::env::var("OPENROUTER_PROVISIONING_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from)
    }

    /// Assemble the core configuration.
    pub fn core_config(&self) -> Result<CoreConfig> {
        let mut core = CoreConfig::new(Self::gateway_token()?, &self.sandbox.data_dir);
        core.sandbox_image = self.sandbox.image.clone();
        core.port_range_start = self.sandbox.port_range_start;
        core.port_range_end = self.sandbox.port_range_end;
        core.connect_timeout = Duration::from_secs(self.sandbox.connect_timeout_secs);
        core.gateway_ready_timeout = Duration::from_secs(self.sandbox.ready_timeout_secs);
        core.turn_timeout = Duration::from_secs(self.sandbox.turn_timeout_secs);
        core.idle_timeout = Duration::from_secs(self.sandbox.idle_timeout_secs);
        core.queue_depth = self.sandbox.queue_depth;
        Ok(core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.sandbox.port_range_start, 30000);
        assert_eq!(config.sandbox.queue_depth, 3);
        assert!(config.channel.outbound_url.is_empty());
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: AppConfig = toml::from_str(
            r#"
            [sandbox]
            image = "warden-sandbox:nightly"
            turn_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.image, "warden-sandbox:nightly");
        assert_eq!(config.sandbox.turn_timeout_secs, 30);
        assert_eq!(config.sandbox.idle_timeout_secs, 1800);
    }
}
