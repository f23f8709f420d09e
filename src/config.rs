//! Configuration for termcast.
//!
//! Settings come from `~/.termcast/config.toml`; command line options are
//! applied on top by `main`. Every key is optional:
//!
//! ```toml
//! host = "noway.ratry.ru"
//! port = 31337
//! user = "alice"
//! password = "asdf"
//! bell_on_watcher = false
//!
//! # Seconds
//! timeout = 5
//! reconnect_delay = 5
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::session::SessionOptions;
use crate::net::connection::ConnectionConfig;

pub const DEFAULT_HOST: &str = "noway.ratry.ru";
pub const DEFAULT_PORT: u16 = 31337;
pub const DEFAULT_PASSWORD: &str = "asdf";
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// A zero timeout would fail every handshake and write
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server host name or address
    pub host: String,
    pub port: u16,
    /// Broadcast name; `$USER` when unset
    pub user: Option<String>,
    pub password: String,
    /// Ring the bell when a watcher comes or goes
    pub bell_on_watcher: bool,
    /// Handshake and write timeout in seconds, at least `MIN_TIMEOUT_SECS`
    pub timeout: u64,
    /// Pause between connection attempts in seconds
    pub reconnect_delay: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: None,
            password: DEFAULT_PASSWORD.to_string(),
            bell_on_watcher: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY_SECS,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match fs::read_to_string(&path) {
                    Ok(content) => match Self::parse(&content) {
                        Ok(config) => return config,
                        Err(e) => warn!("Ignoring {}: {}", path.display(), e),
                    },
                    Err(e) => warn!("Couldn't read {}: {}", path.display(), e),
                }
            }
        }
        Self::default()
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// `~/.termcast`, created on first use
    pub fn data_dir() -> Option<PathBuf> {
        let dir = home_dir()?.join(".termcast");
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }
        Some(dir)
    }

    fn config_path() -> Option<PathBuf> {
        Self::data_dir().map(|dir| dir.join("config.toml"))
    }

    /// The configured user, else the login name from the environment
    pub fn effective_user(&self) -> String {
        self.user
            .clone()
            .or_else(|| env::var("USER").ok())
            .unwrap_or_default()
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.effective_user(),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.timeout.max(MIN_TIMEOUT_SECS)),
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            bell_on_watcher: self.bell_on_watcher,
        }
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}
