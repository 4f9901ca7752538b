//! Persisted configuration
//!
//! A single user-scoped YAML file at `~/.claraverse/mcp-config.yaml` holds
//! the cloud endpoint, cached credentials, the provider descriptors, and the
//! optional browser auto-launch block. Writes are atomic (tmp + rename) and
//! the file is chmod 0600 because it carries tokens.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default cloud WebSocket endpoint.
pub const DEFAULT_WS_URL: &str = "wss://cloud.claraverse.ai/api/companion/ws";
/// Default cloud HTTP API base.
pub const DEFAULT_API_BASE: &str = "https://cloud.claraverse.ai";

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_transport() -> String {
    "stdio".to_string()
}

fn default_true() -> bool {
    true
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cloud endpoints
    pub cloud: CloudConfig,
    /// Cached credentials
    pub auth: CredentialsConfig,
    /// Provider descriptors
    pub providers: Vec<ProviderConfig>,
    /// Browser auto-launch block (persisted and reported, never acted on by
    /// the bridge itself)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserConfig>,
}

/// Cloud endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// WebSocket endpoint for the persistent channel
    pub ws_url: String,
    /// HTTP base for refresh, login, and the devices API
    pub api_base: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_base: default_api_base(),
        }
    }
}

/// Cached credential triple plus optional device identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Opaque access token
    pub access_token: String,
    /// Opaque refresh token
    pub refresh_token: String,
    /// Absolute expiry, unix seconds; 0 means unknown
    pub expires_at: i64,
    /// Device identity assigned at registration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl CredentialsConfig {
    /// Whether a credential pair is present at all.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty()
    }

    /// Drop all credential material.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Provider descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable unique name
    pub name: String,
    /// Human description
    #[serde(default)]
    pub description: String,
    /// Executable path or command
    pub command: String,
    /// Argument vector
    #[serde(default)]
    pub args: Vec<String>,
    /// Transport kind; only "stdio" is supported
    #[serde(rename = "type", default = "default_transport")]
    pub transport: String,
    /// Whether the provider should be running
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Browser auto-launch block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Open the web UI when the bridge starts
    pub auto_launch: bool,
    /// URL to open
    pub url: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            auto_launch: false,
            url: String::new(),
        }
    }
}

impl Config {
    /// Resolve the configuration path: explicit override, or
    /// `$HOME/.claraverse/mcp-config.yaml`.
    #[must_use]
    pub fn path(override_path: Option<&Path>) -> PathBuf {
        if let Some(path) = override_path {
            return path.to_path_buf();
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claraverse")
            .join("mcp-config.yaml")
    }

    /// Load configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the file is missing or unparseable.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file does not
    /// exist yet (first run, before `login`).
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist atomically: write a sibling temp file, fsync, rename over the
    /// target. Mode 0600 on unix.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the directory cannot be created or the
    /// write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("cannot create {}: {e}", parent.display())))?;
        }

        let raw = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, &raw)
            .map_err(|e| Error::Config(format!("cannot write {}: {e}", tmp.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::Config(format!("cannot chmod {}: {e}", tmp.display())))?;
        }

        fs::rename(&tmp, path)
            .map_err(|e| Error::Config(format!("cannot rename onto {}: {e}", path.display())))?;
        Ok(())
    }

    /// Reject descriptors the supervisor cannot honor.
    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(Error::Config("provider with empty name".into()));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
            if provider.transport != "stdio" {
                return Err(Error::Config(format!(
                    "provider {}: unsupported transport {}",
                    provider.name, provider.transport
                )));
            }
        }
        Ok(())
    }

    /// Find a provider descriptor by name.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Mutable lookup.
    pub fn provider_mut(&mut self, name: &str) -> Option<&mut ProviderConfig> {
        self.providers.iter_mut().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> Config {
        Config {
            cloud: CloudConfig::default(),
            auth: CredentialsConfig {
                access_token: "at-1".into(),
                refresh_token: "rt-1".into(),
                expires_at: 1_700_000_000,
                device_id: Some("dev-1".into()),
            },
            providers: vec![ProviderConfig {
                name: "fs".into(),
                description: "filesystem".into(),
                command: "fs-provider".into(),
                args: vec!["--root".into(), "/tmp".into()],
                transport: "stdio".into(),
                enabled: true,
            }],
            browser: None,
        }
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-config.yaml");

        let config = sample();
        config.save(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();

        assert_eq!(reloaded.providers, config.providers);
        assert_eq!(reloaded.auth, config.auth);
        assert_eq!(reloaded.cloud.ws_url, config.cloud.ws_url);
    }

    #[test]
    fn save_is_atomic_no_tmp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-config.yaml");
        sample().save(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("yaml.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_user_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-config.yaml");
        sample().save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let config = Config::load_or_default(&path).unwrap();
        assert!(!config.auth.is_logged_in());
        assert!(config.providers.is_empty());
        assert_eq!(config.cloud.ws_url, DEFAULT_WS_URL);
    }

    #[test]
    fn duplicate_provider_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-config.yaml");
        let mut config = sample();
        config.providers.push(config.providers[0].clone());
        config.save(&path).unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn unsupported_transport_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-config.yaml");
        let mut config = sample();
        config.providers[0].transport = "http".into();
        config.save(&path).unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn descriptor_defaults_from_minimal_yaml() {
        let raw = "providers:\n  - name: fs\n    command: fs-provider\n";
        let config: Config = serde_yaml::from_str(raw).unwrap();
        let provider = &config.providers[0];
        assert_eq!(provider.transport, "stdio");
        assert!(provider.enabled);
        assert!(provider.args.is_empty());
    }

    #[test]
    fn logout_clears_credentials() {
        let mut auth = sample().auth;
        assert!(auth.is_logged_in());
        auth.clear();
        assert!(!auth.is_logged_in());
        assert_eq!(auth.expires_at, 0);
        assert!(auth.device_id.is_none());
    }
}
