//! Client configuration management.
//!
//! This module handles loading the client configuration: backend and
//! identity-provider endpoints plus the request-pipeline limits.
//!
//! Configuration is stored at `~/.config/storefront/config.json`; any field
//! missing from the file takes its default, and a few environment variables
//! override the file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Application name used for config/data directory paths
const APP_NAME: &str = "storefront";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Credential file name in the data directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Backend used during development (iOS simulator maps localhost straight through).
const DEFAULT_API_BASE_URL: &str = "http://localhost:8001";

const DEFAULT_IDENTITY_AUTH_URL: &str = "https://identitytoolkit.googleapis.com/v1";
const DEFAULT_IDENTITY_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Admission ceiling for the request queue.
const DEFAULT_MAX_REQUESTS_PER_SECOND: usize = 10;

/// Maximum number of retries for overloaded (429) requests.
const DEFAULT_MAX_OVERLOAD_RETRIES: u32 = 3;

/// Pause applied when a 429 carries no Retry-After hint.
const DEFAULT_OVERLOAD_PAUSE_MS: u64 = 1000;

/// Delay before re-checking a full rate window.
const DEFAULT_DRAIN_RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Web API key of the identity project
    pub api_key: String,
    /// Base URL for sign-in endpoints (`accounts:signInWith...`)
    pub auth_base_url: String,
    /// Base URL for the token refresh endpoint
    pub token_base_url: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            auth_base_url: DEFAULT_IDENTITY_AUTH_URL.to_string(),
            token_base_url: DEFAULT_IDENTITY_TOKEN_URL.to_string(),
        }
    }
}

/// Where credentials are persisted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    /// JSON file in the data directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub identity: IdentityConfig,
    pub request_timeout_secs: u64,
    pub max_requests_per_second: usize,
    pub max_overload_retries: u32,
    pub default_overload_pause_ms: u64,
    pub drain_retry_delay_ms: u64,
    pub credential_backend: CredentialBackend,
    /// Overrides the credential file location (defaults to the data dir)
    pub credentials_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            identity: IdentityConfig::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_requests_per_second: DEFAULT_MAX_REQUESTS_PER_SECOND,
            max_overload_retries: DEFAULT_MAX_OVERLOAD_RETRIES,
            default_overload_pause_ms: DEFAULT_OVERLOAD_PAUSE_MS,
            drain_retry_delay_ms: DEFAULT_DRAIN_RETRY_DELAY_MS,
            credential_backend: CredentialBackend::File,
            credentials_path: None,
        }
    }
}

impl ClientConfig {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("STOREFRONT_API_URL") {
            self.api_base_url = url;
        }
        if let Some(key) = lookup("STOREFRONT_IDENTITY_API_KEY") {
            self.identity.api_key = key;
        }
        if let Some(rps) = lookup("STOREFRONT_MAX_RPS") {
            match rps.parse::<usize>() {
                Ok(value) if value > 0 => self.max_requests_per_second = value,
                _ => warn!(value = %rps, "Ignoring invalid STOREFRONT_MAX_RPS"),
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Location of the file-backed credential store.
    pub fn credentials_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.credentials_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(CREDENTIALS_FILE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn default_overload_pause(&self) -> Duration {
        Duration::from_millis(self.default_overload_pause_ms)
    }

    pub fn drain_retry_delay(&self) -> Duration {
        Duration::from_millis(self.drain_retry_delay_ms)
    }

    /// Join a path onto the backend base URL.
    pub fn api_url(&self, path: &str) -> String {
        join_url(&self.api_base_url, path)
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_takes_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"api_base_url": "https://shop.example"}"#).unwrap();
        assert_eq!(config.api_base_url, "https://shop.example");
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert_eq!(config.max_overload_retries, DEFAULT_MAX_OVERLOAD_RETRIES);
        assert_eq!(config.identity.token_base_url, DEFAULT_IDENTITY_TOKEN_URL);
        assert_eq!(config.credential_backend, CredentialBackend::File);
    }

    #[test]
    fn test_keyring_backend_from_file() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"credential_backend": "keyring"}"#).unwrap();
        assert_eq!(config.credential_backend, CredentialBackend::Keyring);
    }

    #[test]
    fn test_overrides() {
        let mut config = ClientConfig::default();
        config.apply_overrides(|name| match name {
            "STOREFRONT_API_URL" => Some("https://api.example".to_string()),
            "STOREFRONT_MAX_RPS" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.api_base_url, "https://api.example");
        // zero is rejected
        assert_eq!(config.max_requests_per_second, DEFAULT_MAX_REQUESTS_PER_SECOND);

        config.apply_overrides(|name| (name == "STOREFRONT_MAX_RPS").then(|| "25".to_string()));
        assert_eq!(config.max_requests_per_second, 25);
    }

    #[test]
    fn test_api_url_joins_slashes() {
        let config = ClientConfig {
            api_base_url: "http://localhost:8001/".to_string(),
            ..ClientConfig::default()
        };
        assert_eq!(config.api_url("/api/profile"), "http://localhost:8001/api/profile");
        assert_eq!(config.api_url("api/items"), "http://localhost:8001/api/items");
    }
}
