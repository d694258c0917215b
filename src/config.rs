//! Configuration and settings management
//!
//! Loads settings from environment variables and defines the constants that
//! shape download, extraction and delivery behaviour.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Root directory for raw downloads (`{download_path}/{user_id}/{file}`)
    #[serde(default = "default_download_path")]
    pub download_path: PathBuf,

    /// Root directory for extracted archives (`{extract_path}/{user_id}/{dir}`)
    #[serde(default = "default_extract_path")]
    pub extract_path: PathBuf,

    /// Custom Bot API server (e.g. a local `telegram-bot-api` for large uploads)
    pub base_api_url: Option<String>,

    /// Comma-separated list of allowed user IDs. Empty means everyone.
    #[serde(rename = "allowed_users")]
    pub allowed_users_str: Option<String>,

    /// Comma-separated list of blocked network origins
    #[serde(rename = "blocked_ips")]
    pub blocked_ips_str: Option<String>,
}

fn default_download_path() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_extract_path() -> PathBuf {
    PathBuf::from("./extracts")
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use oxide_fetch::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Local overrides, not checked into git
            .add_source(File::with_name("config/local").required(false))
            // Eg.. `APP_DOWNLOAD_PATH=/data ./target/app`
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Plain UPPER_SNAKE_CASE variables, empty values treated as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Returns a set of Telegram IDs that are allowed to use the bot.
    ///
    /// An empty set means the bot is open to everyone.
    #[must_use]
    pub fn allowed_users(&self) -> HashSet<i64> {
        split_list(self.allowed_users_str.as_deref())
            .filter_map(|id| id.parse::<i64>().ok())
            .collect()
    }

    /// Whether `user_id` may talk to the bot
    #[must_use]
    pub fn is_user_allowed(&self, user_id: i64) -> bool {
        let allowed = self.allowed_users();
        allowed.is_empty() || allowed.contains(&user_id)
    }

    /// Network origins that are rejected before rate limiting
    #[must_use]
    pub fn blocked_ips(&self) -> Vec<IpAddr> {
        split_list(self.blocked_ips_str.as_deref())
            .filter_map(|ip| ip.parse::<IpAddr>().ok())
            .collect()
    }
}

fn split_list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty())
}

// Transfer configuration
/// Parallel range streams requested from the transfer engine
pub const PARALLEL_STREAMS: usize = 3;
/// Window for the engine to resolve the file name of a new session
pub const FILENAME_RESOLVE_TIMEOUT_SECS: u64 = 10;
/// Interval between transfer status polls
pub const PROGRESS_POLL_INTERVAL_MS: u64 = 1000;
/// Minimum gap between two progress message edits in Telegram
pub const PROGRESS_EDIT_THROTTLE_MS: u64 = 1500;
/// Longest accepted URL
pub const MAX_URL_LENGTH: usize = 2048;

// Upload configuration
/// Maximum delivery attempts per item
pub const UPLOAD_MAX_ATTEMPTS: u32 = 5;
/// Delay between two sequential deliveries
pub const UPLOAD_PACING_SECS: u64 = 8;

// Access guard configuration
/// Requests allowed per user within one window
pub const RATE_LIMIT_POINTS: u32 = 10;
/// Length of the rate limit window
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
/// How long a user stays blocked after exceeding the quota
pub const RATE_LIMIT_BLOCK_SECS: u64 = 15 * 60;
/// Maximum number of users tracked by the rate limiter
pub const RATE_LIMIT_CACHE_MAX_SIZE: u64 = 10_000;
/// Sessions left `Pending` longer than this are dropped
pub const PENDING_SESSION_TTL_SECS: u64 = 10 * 60;
/// Seconds between two "slow down" notices to the same user
pub const DENIAL_NOTICE_COOLDOWN_SECS: u64 = 15 * 60;
/// Maximum number of users tracked by the notice cache
pub const DENIAL_NOTICE_CACHE_MAX_SIZE: u64 = 10_000;

// Telegram API retry configuration
/// Retries for plain text sends/edits
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
/// Initial backoff for plain text sends/edits
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Backoff ceiling for plain text sends/edits
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;
