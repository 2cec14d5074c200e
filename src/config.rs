//! Client configuration: a JSON file with environment overrides.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/client.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "PENNY_CLIENT_CONFIG_PATH";
const SERVER_URL_ENV: &str = "PENNY_SERVER_URL";
const ROOM_ID_ENV: &str = "PENNY_ROOM_ID";
const USERNAME_ENV: &str = "PENNY_USERNAME";
const SPECTATOR_ENV: &str = "PENNY_SPECTATOR";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
/// Runtime configuration for the observer binary and the session it drives.
pub struct ClientConfig {
    /// Base HTTP URL of the game server; the websocket URL is derived from it.
    pub server_url: String,
    /// Room to join. A new room is created when absent.
    pub room_id: Option<String>,
    pub username: String,
    pub spectator: bool,
    pub hold_threshold_ms: u64,
    pub request_timeout_ms: u64,
    /// Period of the timer display refresh.
    pub refresh_interval_ms: u64,
    pub signal_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".into(),
            room_id: None,
            username: "observer".into(),
            spectator: true,
            hold_threshold_ms: 800,
            request_timeout_ms: 5000,
            refresh_interval_ms: 1000,
            signal_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Load the configuration from disk, falling back to built-in defaults,
    /// then apply environment overrides.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let config = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded client config");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        };
        config.with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup` (the process environment in production).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = lookup(SERVER_URL_ENV) {
            self.server_url = url;
        }
        if let Some(room) = lookup(ROOM_ID_ENV) {
            self.room_id = Some(room);
        }
        if let Some(username) = lookup(USERNAME_ENV) {
            self.username = username;
        }
        if let Some(flag) = lookup(SPECTATOR_ENV) {
            match parse_flag(&flag) {
                Some(spectator) => self.spectator = spectator,
                None => warn!(value = %flag, "ignoring unrecognised {SPECTATOR_ENV} value"),
            }
        }
        self
    }

    pub fn hold_threshold(&self) -> Duration {
        Duration::from_millis(self.hold_threshold_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
