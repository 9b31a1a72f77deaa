//! Client configuration module.
//!
//! Parses configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SERVERLIST_SUPABASE_URL` | Yes | - | URL of the Supabase project |
//! | `SERVERLIST_SUPABASE_ANON_KEY` | Yes | - | Supabase anon/public key |
//! | `SERVERLIST_SITE_URL` | No | `http://localhost:5173` | Base URL of the web site, used in password reset links |
//! | `SERVERLIST_SESSION_CHECK_INTERVAL_SECS` | No | 60 | Seconds between session expiry checks |
//! | `SERVERLIST_DATA_DIR` | No | `~/.serverlist` | Directory holding the persisted auth state |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::session::SessionManagerConfig;

/// Default site URL.
const DEFAULT_SITE_URL: &str = "http://localhost:5173";

/// Default seconds between session expiry checks.
const DEFAULT_SESSION_CHECK_INTERVAL_SECS: u64 = 60;

/// Default data directory name relative to home.
const DEFAULT_DATA_DIR: &str = ".serverlist";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Client configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the Supabase project (e.g., `https://xxx.supabase.co`).
    pub supabase_url: String,

    /// Supabase anon/public key.
    pub supabase_anon_key: String,

    /// Base URL of the web site.
    pub site_url: String,

    /// Interval between session expiry checks.
    pub session_check_interval: Duration,

    /// Directory holding the persisted auth state.
    pub data_dir: PathBuf,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `SERVERLIST_SUPABASE_URL` or `SERVERLIST_SUPABASE_ANON_KEY` is missing or empty
    /// - `SERVERLIST_SUPABASE_URL` or `SERVERLIST_SITE_URL` is not an http(s) URL
    /// - `SERVERLIST_SESSION_CHECK_INTERVAL_SECS` is not a positive integer
    /// - No data directory is set and the home directory cannot be determined
    ///
    /// # Example
    ///
    /// ```no_run
    /// use serverlist_client::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Using project {}", config.supabase_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let supabase_url = required("SERVERLIST_SUPABASE_URL")?;
        check_http_url("SERVERLIST_SUPABASE_URL", &supabase_url)?;
        let supabase_anon_key = required("SERVERLIST_SUPABASE_ANON_KEY")?;

        let site_url = env::var("SERVERLIST_SITE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SITE_URL.to_string());
        check_http_url("SERVERLIST_SITE_URL", &site_url)?;

        // Optional: SERVERLIST_SESSION_CHECK_INTERVAL_SECS (default: 60, must be > 0)
        let interval_secs = match env::var("SERVERLIST_SESSION_CHECK_INTERVAL_SECS") {
            Ok(val) => {
                let secs = val.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                    key: "SERVERLIST_SESSION_CHECK_INTERVAL_SECS".to_string(),
                    message: format!("expected positive integer, got '{val}'"),
                })?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "SERVERLIST_SESSION_CHECK_INTERVAL_SECS".to_string(),
                        message: "interval must be at least 1 second".to_string(),
                    });
                }
                secs
            }
            Err(_) => DEFAULT_SESSION_CHECK_INTERVAL_SECS,
        };

        let data_dir = match env::var("SERVERLIST_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs.home_dir().join(DEFAULT_DATA_DIR)
            }
        };

        Ok(Self {
            supabase_url: supabase_url.trim_end_matches('/').to_string(),
            supabase_anon_key,
            site_url: site_url.trim_end_matches('/').to_string(),
            session_check_interval: Duration::from_secs(interval_secs),
            data_dir,
        })
    }

    /// Session manager settings derived from this configuration.
    pub fn session_manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig::for_site(&self.site_url, self.session_check_interval)
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

fn check_http_url(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("https://") || value.starts_with("http://") {
        return Ok(());
    }
    Err(ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected an http(s) URL, got '{value}'"),
    })
}
