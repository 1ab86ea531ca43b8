use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;
use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_PROFILE: &str = "default";
pub const DEFAULT_REFRESH_LEAD_SECS: i64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const API_URL_VAR: &str = "INFORMES_API_URL";
const PROFILE_VAR: &str = "INFORMES_PROFILE";
const REFRESH_LEAD_VAR: &str = "INFORMES_REFRESH_LEAD_SECS";

/// Runtime settings shared by the session manager and the request executor.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: Url,
    /// Safety margin subtracted from the access token expiry when scheduling renewal.
    pub refresh_lead_time: Duration,
    pub request_timeout: StdDuration,
    pub profile: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: Url::parse(DEFAULT_API_URL).expect("valid default API URL"),
            refresh_lead_time: Duration::seconds(DEFAULT_REFRESH_LEAD_SECS),
            request_timeout: StdDuration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            profile: DEFAULT_PROFILE.to_owned(),
        }
    }
}

impl ClientConfig {
    pub fn new(api_base: Url) -> Self {
        Self {
            api_base,
            ..Self::default()
        }
    }

    /// Build a configuration from `INFORMES_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = non_empty_var(API_URL_VAR) {
            config.api_base = Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl {
                var: API_URL_VAR,
                source,
            })?;
        }

        if let Some(profile) = non_empty_var(PROFILE_VAR) {
            config.profile = profile;
        }

        if let Some(raw) = non_empty_var(REFRESH_LEAD_VAR) {
            let seconds = raw
                .parse::<i64>()
                .ok()
                .filter(|value| *value >= 0)
                .ok_or(ConfigError::InvalidNumber {
                    var: REFRESH_LEAD_VAR,
                    value: raw.clone(),
                })?;
            config.refresh_lead_time = Duration::seconds(seconds);
        }

        Ok(config)
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_refresh_lead_time(mut self, lead: Duration) -> Self {
        self.refresh_lead_time = lead;
        self
    }

    pub fn with_request_timeout(mut self, timeout: StdDuration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Resolve an API path against the configured base. Absolute URLs pass through unchanged.
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path);
        }
        let mut base = self.api_base.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// Application-specific configuration helpers.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs =
            ProjectDirs::from("mx", "informes", "informes").ok_or(ConfigError::MissingProjectDirs)?;
        let config_dir = dirs.config_dir();
        fs::create_dir_all(config_dir).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(config_dir)?;
        Ok(Self {
            root: config_dir.to_path_buf(),
        })
    }

    pub fn from_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Path to the persisted session slots for the given profile.
    pub fn session_file(&self, profile: &str) -> PathBuf {
        self.root.join(format!("session-{profile}.json"))
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Errors that can occur while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for informes")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("invalid URL in {var}: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value '{value}' in {var}")]
    InvalidNumber { var: &'static str, value: String },
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}
