//! Configuration loading for Handoff.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the Handoff home directory (~/.handoff).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".handoff"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.handoff/settings.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

/// Load settings from an explicit path.
pub fn load_settings_from(path: &std::path::Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}. Run 'handoff init' first.",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Write settings as pretty JSON, creating the parent directory.
pub fn save_settings_to(settings: &Settings, path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// Shortest signing secret accepted for agent tokens.
pub const MIN_JWT_SECRET_LEN: usize = 16;

/// Placeholder shipped by early builds. Tokens signed with it are forgeable.
const PLACEHOLDER_JWT_SECRET: &str = "handoff-secret-key-change-in-production";

/// Fresh random signing secret for a new installation.
pub fn generate_jwt_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let secret = settings.auth.jwt_secret.trim();
    if secret.is_empty() {
        return Err(Error::Config(
            "auth.jwt_secret is not set. Run 'handoff init' or set HANDOFF_JWT_SECRET.".to_string(),
        ));
    }
    if secret == PLACEHOLDER_JWT_SECRET {
        return Err(Error::Config(
            "auth.jwt_secret is the public placeholder; generate a new one".to_string(),
        ));
    }
    if secret.len() < MIN_JWT_SECRET_LEN {
        return Err(Error::Config(format!(
            "auth.jwt_secret must be at least {} characters",
            MIN_JWT_SECRET_LEN
        )));
    }
    if settings.presence.typing_ttl_secs == 0 {
        return Err(Error::Config(
            "presence.typing_ttl_secs must be greater than zero".to_string(),
        ));
    }
    if settings.presence.channel_capacity == 0 {
        return Err(Error::Config(
            "presence.channel_capacity must be greater than zero".to_string(),
        ));
    }
    if settings.queue.default_limit == 0 || settings.queue.default_limit > settings.queue.max_limit {
        return Err(Error::Config(format!(
            "queue.default_limit must be between 1 and queue.max_limit ({})",
            settings.queue.max_limit
        )));
    }
    Ok(())
}

/// Database configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Database {
    /// SQLite file path. Relative paths resolve against the home directory.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("handoff.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for Database {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Web server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Web {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3334
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

impl Default for Web {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Identity gateway configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Auth {
    /// HS256 signing secret. Empty until `handoff init` generates one.
    #[serde(default)]
    pub jwt_secret: String,
    /// Lifetime of tokens issued by `handoff token`.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_token_ttl_secs() -> u64 {
    86400
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

/// Presence (typing indicator) configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Presence {
    /// Persisted indicator lifetime after the last signal.
    #[serde(default = "default_typing_ttl_secs")]
    pub typing_ttl_secs: u64,
    /// Window after which viewers drop a broadcast signal on their own.
    #[serde(default = "default_advisory_window_secs")]
    pub advisory_window_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Per-topic broadcast buffer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_typing_ttl_secs() -> u64 {
    10
}

fn default_advisory_window_secs() -> u64 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    100
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            typing_ttl_secs: default_typing_ttl_secs(),
            advisory_window_secs: default_advisory_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Listing limits.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Queue {
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
}

fn default_limit() -> u32 {
    20
}

fn default_max_limit() -> u32 {
    100
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

/// Logging configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Logging {
    /// Emit console logs as JSON lines.
    #[serde(default)]
    pub json: bool,
    /// Overrides the default filter when RUST_LOG is unset.
    pub filter: Option<String>,
}

/// Handoff settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub database: Database,

    #[serde(default)]
    pub web: Web,

    #[serde(default)]
    pub auth: Auth,

    #[serde(default)]
    pub presence: Presence,

    #[serde(default)]
    pub queue: Queue,

    #[serde(default)]
    pub logging: Logging,
}

impl Settings {
    /// Resolve the database path against the home directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        if self.database.path.is_absolute() {
            Ok(self.database.path.clone())
        } else {
            Ok(get_home_dir()?.join(&self.database.path))
        }
    }
}
