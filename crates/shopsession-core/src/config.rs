//! Session manager configuration.
//!
//! This module handles loading and saving the configuration, which selects
//! the API base URL, the deployment (storefront or admin), the credential
//! storage backend, and the refresh timing.
//!
//! Configuration is stored at `~/.config/shopsession/config.json`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "shopsession";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default API base URL (the backend's `/api/` prefix).
const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api/";

/// Passive refresh period in seconds.
/// Access tokens live for five minutes server-side; refreshing every four
/// keeps most requests from ever seeing a 401.
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 240;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Which application a session belongs to.
///
/// The storefront and the admin dashboard keep independent credential stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    #[default]
    Storefront,
    Admin,
}

impl Deployment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Deployment::Storefront => "storefront",
            Deployment::Admin => "admin",
        }
    }

    /// Storage key for the access credential
    pub fn access_key(&self) -> &'static str {
        match self {
            Deployment::Storefront => "access",
            Deployment::Admin => "admin_access",
        }
    }

    /// Storage key for the refresh credential
    pub fn refresh_key(&self) -> &'static str {
        match self {
            Deployment::Storefront => "refresh",
            Deployment::Admin => "admin_refresh",
        }
    }

    /// Admin sessions are only accepted for staff identities.
    pub fn requires_staff(&self) -> bool {
        matches!(self, Deployment::Admin)
    }
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Deployment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "storefront" | "store" | "client" => Ok(Deployment::Storefront),
            "admin" => Ok(Deployment::Admin),
            other => Err(anyhow::anyhow!("Unknown deployment: {}", other)),
        }
    }
}

/// Where credentials are persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// JSON file in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub deployment: Deployment,
    pub storage: StorageKind,
    /// Passive refresh period; 0 disables the timer.
    pub refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Upper bound on a single refresh call. Unset means the refresh waits
    /// as long as the transport does.
    pub refresh_timeout_secs: Option<u64>,
    pub token_path: String,
    pub refresh_path: String,
    pub identity_path: String,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            deployment: Deployment::default(),
            storage: StorageKind::default(),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: None,
            token_path: "token/".to_string(),
            refresh_path: "token/refresh/".to_string(),
            identity_path: "user/".to_string(),
            last_username: None,
        }
    }
}

impl Config {
    /// Config pointing at `api_url` with every other setting at its default.
    pub fn for_api(api_url: impl Into<String>, deployment: Deployment) -> Self {
        Self {
            api_url: api_url.into(),
            deployment,
            ..Self::default()
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Record `username` as the last one used. Only that field changes on
    /// disk; command-line and environment overrides are never written back.
    pub fn remember_username(username: &str) -> Result<()> {
        Self::remember_username_in(&Self::config_path()?, username)
    }

    pub fn remember_username_in(path: &Path, username: &str) -> Result<()> {
        let mut saved = Self::load_from(path)?;
        saved.last_username = Some(username.to_string());
        saved.save_to(path)
    }

    /// Apply `SHOPSESSION_*` environment overrides on top of the loaded file.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("SHOPSESSION_API_URL") {
            self.api_url = url;
        }
        if let Ok(deployment) = std::env::var("SHOPSESSION_DEPLOYMENT") {
            self.deployment = deployment.parse()?;
        }
        if let Ok(secs) = std::env::var("SHOPSESSION_REFRESH_INTERVAL_SECS") {
            self.refresh_interval_secs = secs
                .trim()
                .parse()
                .context("SHOPSESSION_REFRESH_INTERVAL_SECS must be a number of seconds")?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Resolve an endpoint against the API base URL. Absolute URLs pass through.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        resolve_endpoint(&self.api_url, endpoint)
    }

    pub fn token_url(&self) -> String {
        self.endpoint_url(&self.token_path)
    }

    pub fn refresh_url(&self) -> String {
        self.endpoint_url(&self.refresh_path)
    }

    pub fn identity_url(&self) -> String {
        self.endpoint_url(&self.identity_path)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Option<Duration> {
        self.refresh_timeout_secs.map(Duration::from_secs)
    }
}

pub(crate) fn resolve_endpoint(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_endpoint() {
        assert_eq!(
            resolve_endpoint("http://127.0.0.1:8000/api/", "user/"),
            "http://127.0.0.1:8000/api/user/"
        );
        assert_eq!(
            resolve_endpoint("http://127.0.0.1:8000/api", "/orders/"),
            "http://127.0.0.1:8000/api/orders/"
        );
        assert_eq!(
            resolve_endpoint("http://127.0.0.1:8000/api/", "https://cdn.example.com/x"),
            "https://cdn.example.com/x"
        );
    }

    #[test]
    fn test_deployment_keys_are_independent() {
        assert_eq!(Deployment::Storefront.access_key(), "access");
        assert_eq!(Deployment::Storefront.refresh_key(), "refresh");
        assert_eq!(Deployment::Admin.access_key(), "admin_access");
        assert_eq!(Deployment::Admin.refresh_key(), "admin_refresh");
        assert!(Deployment::Admin.requires_staff());
        assert!(!Deployment::Storefront.requires_staff());
    }

    #[test]
    fn test_deployment_from_str() {
        assert_eq!("admin".parse::<Deployment>().ok(), Some(Deployment::Admin));
        assert_eq!(" Storefront ".parse::<Deployment>().ok(), Some(Deployment::Storefront));
        assert!("backoffice".parse::<Deployment>().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(240)));
        assert_eq!(config.refresh_timeout(), None);
        assert_eq!(config.token_url(), "http://127.0.0.1:8000/api/token/");
        assert_eq!(config.refresh_url(), "http://127.0.0.1:8000/api/token/refresh/");
        assert_eq!(config.identity_url(), "http://127.0.0.1:8000/api/user/");
    }

    #[test]
    fn test_zero_interval_disables_timer() {
        let config = Config {
            refresh_interval_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.refresh_interval(), None);
    }

    #[test]
    fn test_remember_username_keeps_saved_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        Config::for_api("https://shop.example.com/api/", Deployment::Storefront)
            .save_to(&path)
            .expect("save");

        Config::remember_username_in(&path, "gg").expect("remember");

        let saved = Config::load_from(&path).expect("reload");
        assert_eq!(saved.last_username.as_deref(), Some("gg"));
        assert_eq!(saved.deployment, Deployment::Storefront);
        assert_eq!(saved.api_url, "https://shop.example.com/api/");
    }

    #[test]
    fn test_load_from_missing_file_is_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(&dir.path().join("absent.json")).expect("load");
        assert_eq!(config.deployment, Deployment::Storefront);
        assert!(config.last_username.is_none());
    }

    #[test]
    fn test_partial_config_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"deployment": "admin", "refresh_timeout_secs": 10}"#)
                .expect("partial config should parse");
        assert_eq!(config.deployment, Deployment::Admin);
        assert_eq!(config.refresh_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }
}
