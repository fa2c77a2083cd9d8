//! feed-sync/crates/configs/src/lib.rs
//!
//! Layered settings for the feed-sync binary. Sources, lowest to highest
//! precedence:
//!
//! 1. built-in defaults
//! 2. an optional `feed-sync.toml` (or the file named by `FEED_SYNC_CONFIG`)
//! 3. `FEED__SECTION__KEY` environment variables, after `.env` is loaded
//!
//! The session token is held as a `SecretString` and never printed.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "feed-sync.toml";
pub const CONFIG_FILE_ENV: &str = "FEED_SYNC_CONFIG";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
pub struct ApiSettings {
    pub base_url: String,
    /// Header the session token is sent in.
    pub auth_header: String,
    /// Zero or absent disables the request timeout.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StorageSettings {
    /// Directory holding persisted store blobs.
    pub data_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct ProbingSettings {
    /// How long a winning endpoint is remembered. 0 disables memoization.
    pub memo_ttl_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct NormalizeSettings {
    pub max_comment_depth: usize,
}

#[derive(Debug, Deserialize)]
pub struct FeedSettings {
    pub page_size: u32,
}

#[derive(Debug, Deserialize)]
pub struct LogSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionSettings {
    pub token: Option<SecretString>,
    pub user_id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub api: ApiSettings,
    pub storage: StorageSettings,
    pub probing: ProbingSettings,
    pub normalize: NormalizeSettings,
    pub feed: FeedSettings,
    pub log: LogSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

impl Settings {
    /// Loads `.env`, then every layer. The config file path comes from
    /// `FEED_SYNC_CONFIG` when set.
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        let file = std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Path::new(&file))
    }

    /// Loads defaults, the optional file at `path`, then the environment.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let settings: Settings = Config::builder()
            .set_default("api.base_url", "http://localhost:5000/api")?
            .set_default("api.auth_header", "x-auth-token")?
            .set_default("storage.data_dir", "./data/feed-sync")?
            .set_default("probing.memo_ttl_secs", 300)?
            .set_default("normalize.max_comment_depth", 8)?
            .set_default("feed.page_size", 20)?
            .set_default("log.level", "info")?
            .set_default("log.json", false)?
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("FEED").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(SettingsError::Invalid(format!(
                "api.base_url must be an http(s) URL, got {:?}",
                self.api.base_url
            )));
        }
        if self.feed.page_size == 0 {
            return Err(SettingsError::Invalid("feed.page_size must be positive".into()));
        }
        if self.normalize.max_comment_depth == 0 {
            return Err(SettingsError::Invalid("normalize.max_comment_depth must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.api
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn memo_ttl(&self) -> Duration {
        Duration::from_secs(self.probing.memo_ttl_secs)
    }
}
