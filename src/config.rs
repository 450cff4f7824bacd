//! # Session Configuration
//!
//! [`ConnectionConfig`] is the immutable, per-session description of how to
//! reach a broker. It is handed to [`crate::session::Session::new`] once and
//! never mutated afterwards; a different configuration means a new session.
//!
//! [`Settings`] is the on-disk form used by the binary: a log level plus a
//! `[connection]` table, stored as TOML. Missing files degrade to defaults so
//! the tool stays usable without any setup.

use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/mqtt-session";
const CONFIG_FILE: &str = "session.toml";

pub const DEFAULT_URL: &str = "mqtt://localhost:1883";
pub const DEFAULT_RECONNECT_PERIOD_MS: u64 = 1000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 4000;

/// Broker connection parameters for one session.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker URL, e.g. `mqtt://broker.local:1883` or `mqtts://host:8883`
    pub url: String,
    /// Client identifier; the transport picks one when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Delay between transport-driven reconnection attempts
    pub reconnect_period_ms: u64,
    pub connect_timeout_ms: u64,
    pub clean_session: bool,
    /// Topics the session should always be subscribed to. They seed the
    /// desired set and are re-subscribed after every reconnect.
    pub topics: Vec<String>,
    /// Transport-specific options, passed through untouched
    pub extra: BTreeMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            client_id: None,
            username: None,
            password: None,
            reconnect_period_ms: DEFAULT_RECONNECT_PERIOD_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            clean_session: true,
            topics: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Looks up and parses a transport-specific option.
    pub fn extra_value<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.extra.get(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring unparsable transport option {}={}", key, raw);
                None
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(eyre!("Broker URL must not be empty"));
        }
        if self.reconnect_period_ms == 0 {
            return Err(eyre!("reconnect_period_ms must be greater than zero"));
        }
        if self.username.is_none() && self.password.is_some() {
            return Err(eyre!("A password was configured without a username"));
        }
        Ok(())
    }
}

/// Settings file layout used by the binary.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub connection: ConnectionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`, falling back to defaults when the file does
    /// not exist. A file that exists but cannot be parsed is an error.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?
        {
            warn!(
                "Settings file {} does not exist, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read settings file: {}", e))?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse settings file {}: {}", path.display(), e))?;
        settings.connection.validate()?;

        info!("Loaded settings from {}", path.display());
        debug!("Settings: {:?}", settings);
        Ok(settings)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create settings directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write settings file: {}", e))?;

        info!("Settings saved to {}", path.display());
        Ok(())
    }
}

/// `~/.config/mqtt-session/session.toml`, or relative to the working
/// directory when no home directory can be determined.
pub fn default_config_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}
