//! Application-level configuration loading, covering every tunable duration
//! of the registry, message channel, housekeeping, and bus layers.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "PLANNING_POKER_CONFIG_PATH";

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Bounded wait for acquiring a team's scoped lock.
    pub lock_wait: Duration,
    /// Default long-poll wait inside the message channel.
    pub message_wait: Duration,
    /// Participants idle longer than this are disconnected by housekeeping.
    pub participant_inactivity: Duration,
    /// Teams abandoned longer than this are purged from the backing store.
    pub team_expiry: Duration,
    /// Cadence of the housekeeping sweep.
    pub housekeeping_interval: Duration,
    /// Cadence of the bus presence heartbeat.
    pub heartbeat_interval: Duration,
    /// Peers not heard from within this window are dropped from the peer set.
    pub peer_inactivity: Duration,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to the
    /// built-in defaults when the file is absent or malformed.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(path = %path.display(), "loaded configuration");
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
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(10),
            message_wait: Duration::from_secs(60),
            participant_inactivity: Duration::from_secs(900),
            team_expiry: Duration::from_secs(1_200),
            housekeeping_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            peer_inactivity: Duration::from_secs(120),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    lock_wait_seconds: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    message_wait_seconds: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    participant_inactivity_seconds: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    team_expiry_seconds: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    housekeeping_interval_seconds: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    heartbeat_interval_seconds: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    peer_inactivity_seconds: Option<Duration>,
}

impl From<RawConfig> for AppConfig {
    fn from(raw: RawConfig) -> Self {
        let defaults = Self::default();
        Self {
            lock_wait: raw.lock_wait_seconds.unwrap_or(defaults.lock_wait),
            message_wait: raw.message_wait_seconds.unwrap_or(defaults.message_wait),
            participant_inactivity: raw
                .participant_inactivity_seconds
                .unwrap_or(defaults.participant_inactivity),
            team_expiry: raw.team_expiry_seconds.unwrap_or(defaults.team_expiry),
            housekeeping_interval: raw
                .housekeeping_interval_seconds
                .unwrap_or(defaults.housekeeping_interval),
            heartbeat_interval: raw
                .heartbeat_interval_seconds
                .unwrap_or(defaults.heartbeat_interval),
            peer_inactivity: raw
                .peer_inactivity_seconds
                .unwrap_or(defaults.peer_inactivity),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.lock_wait, Duration::from_secs(10));
        assert!(config.peer_inactivity > config.heartbeat_interval);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let raw: RawConfig = serde_json::from_str(r#"{"lock_wait_seconds": 3}"#).unwrap();
        let config: AppConfig = raw.into();
        assert_eq!(config.lock_wait, Duration::from_secs(3));
        assert_eq!(config.message_wait, Duration::from_secs(60));
    }
}
