//! Configuration management.
//!
//! This module resolves the mirror database path and builds the
//! [`Settings`] value every remote-facing command runs with.
//!
//! # Sources
//!
//! Settings are layered, later sources winning:
//! 1. Built-in defaults
//! 2. `~/.cadmirror/config.json`
//! 3. Environment (`ONSHAPE_ACCESS_KEY`, `ONSHAPE_SECRET_KEY`, `ONSHAPE_BASE_URL`)
//!
//! `Settings` is built once in `main` and handed down by reference; nothing
//! in the crate reads configuration from global state.

use crate::error::{Error, Result};
use crate::remote::RetryConfig;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default remote API root.
pub const DEFAULT_BASE_URL: &str = "https://cad.onshape.com/api";

/// Default remote API version segment.
pub const DEFAULT_API_VERSION: &str = "v6";

/// How the cascade picks a workspace when no workspace is flagged main.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MainWorkspacePolicy {
    /// Record a note and skip the document.
    #[default]
    Skip,
    /// Use the first workspace by name and record a note saying so.
    FirstWorkspace,
}

/// Runtime settings for remote access and sync behaviour.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub base_url: String,
    pub api_version: String,
    pub request_timeout_secs: u64,
    pub retry: RetrySettings,
    pub worker_count: usize,
    pub document_page_size: u32,
    pub max_document_pages: u32,
    pub default_document_limit: usize,
    pub main_workspace_policy: MainWorkspacePolicy,
    pub cascade_timeout_secs: Option<u64>,
}

/// Retry knobs as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            access_key: None,
            secret_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout_secs: 30,
            retry: RetrySettings::default(),
            worker_count: 2,
            document_page_size: 100,
            max_document_pages: 1,
            default_document_limit: 10,
            main_workspace_policy: MainWorkspacePolicy::Skip,
            cascade_timeout_secs: None,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("retry", &self.retry)
            .field("worker_count", &self.worker_count)
            .field("document_page_size", &self.document_page_size)
            .field("max_document_pages", &self.max_document_pages)
            .field("default_document_limit", &self.default_document_limit)
            .field("main_workspace_policy", &self.main_workspace_policy)
            .field("cascade_timeout_secs", &self.cascade_timeout_secs)
            .finish()
    }
}

impl Settings {
    /// Load settings from the config file and environment.
    ///
    /// A missing config file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let mut settings = match config_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Read settings from a JSON file, falling back to defaults if absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on read or parse failure.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {e}")))
    }

    /// Overlay environment variables through a lookup function.
    ///
    /// Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ONSHAPE_ACCESS_KEY") {
            self.access_key = Some(v);
        }
        if let Some(v) = get("ONSHAPE_SECRET_KEY") {
            self.secret_key = Some(v);
        }
        if let Some(v) = get("ONSHAPE_BASE_URL") {
            self.base_url = v;
        }
    }

    /// Both halves of the API key pair.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if either key is missing.
    pub fn credentials(&self) -> Result<(&str, &str)> {
        match (self.access_key.as_deref(), self.secret_key.as_deref()) {
            (Some(access), Some(secret)) => Ok((access, secret)),
            _ => Err(Error::Config("API access key and secret key are required".into())),
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn cascade_timeout(&self) -> Option<Duration> {
        self.cascade_timeout_secs.map(Duration::from_secs)
    }

    /// Retry policy for the remote client.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter: true,
        }
    }
}

/// Get the global cadmirror directory (`~/.cadmirror/`).
#[must_use]
pub fn global_cadmirror_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".cadmirror"))
}

/// Location of the JSON config file.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    global_cadmirror_dir().map(|dir| dir.join("config.json"))
}

/// Resolve the database path.
///
/// Priority:
/// 1. If `explicit_path` is provided (the `--db` flag, which clap also fills
///    from `CM_DB`), use it directly
/// 2. `CM_DB` environment variable
/// 3. Global location: `~/.cadmirror/data/cadmirror.db`
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if let Ok(db_path) = std::env::var("CM_DB") {
        if !db_path.trim().is_empty() {
            return Some(PathBuf::from(db_path));
        }
    }

    global_cadmirror_dir().map(|dir| dir.join("data").join("cadmirror.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_resolve_db_path_with_explicit() {
        let explicit = PathBuf::from("/custom/path/mirror.db");
        let result = resolve_db_path(Some(&explicit));
        assert_eq!(result, Some(explicit));
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.base_url, DEFAULT_BASE_URL);
        assert_eq!(s.api_version, "v6");
        assert_eq!(s.request_timeout_secs, 30);
        assert_eq!(s.retry.max_attempts, 3);
        assert_eq!(s.worker_count, 2);
        assert_eq!(s.document_page_size, 100);
        assert_eq!(s.default_document_limit, 10);
        assert_eq!(s.main_workspace_policy, MainWorkspacePolicy::Skip);
        assert!(s.cascade_timeout().is_none());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut s = Settings {
            access_key: Some("file-access".into()),
            ..Settings::default()
        };
        let env: HashMap<&str, &str> = [
            ("ONSHAPE_ACCESS_KEY", "env-access"),
            ("ONSHAPE_SECRET_KEY", "env-secret"),
            ("ONSHAPE_BASE_URL", "  "),
        ]
        .into_iter()
        .collect();

        s.apply_env(|k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(s.access_key.as_deref(), Some("env-access"));
        assert_eq!(s.secret_key.as_deref(), Some("env-secret"));
        // blank value ignored
        assert_eq!(s.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"worker_count": 4, "main_workspace_policy": "first_workspace", "retry": {"max_attempts": 5}}"#,
        )
        .unwrap();

        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.worker_count, 4);
        assert_eq!(s.main_workspace_policy, MainWorkspacePolicy::FirstWorkspace);
        assert_eq!(s.retry.max_attempts, 5);
        assert_eq!(s.retry.initial_delay_ms, 200);
        assert_eq!(s.request_timeout_secs, 30);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Settings::from_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let s = Settings {
            secret_key: Some("super-secret-value".into()),
            ..Settings::default()
        };
        let rendered = format!("{s:?}");
        assert!(!rendered.contains("super-secret-value"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_credentials_require_both_keys() {
        let s = Settings {
            access_key: Some("a".into()),
            ..Settings::default()
        };
        assert!(matches!(s.credentials(), Err(Error::Config(_))));
    }
}
