//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`PEERLINK_*`)
//! - CLI arguments (for `peerlink simulate`)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};
use crate::protocol::ProtocolMode;
use crate::queue::DEFAULT_CAPACITY_PER_SESSION;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Handshake and store settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Outbound queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| LinkError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| LinkError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build a config from a variable lookup. Unparseable values are ignored.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // Session settings
        if let Some(modes) = lookup("PEERLINK_SUPPORTED_MODES") {
            let parsed: std::result::Result<Vec<ProtocolMode>, _> =
                modes.split(',').map(str::parse).collect();
            if let Ok(parsed) = parsed {
                config.session.supported_modes = parsed;
            }
        }
        if let Some(val) = lookup("PEERLINK_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(val) = val.parse() {
                config.session.handshake_timeout_ms = val;
            }
        }
        if let Some(val) = lookup("PEERLINK_MAX_WRITE_ATTEMPTS") {
            if let Ok(val) = val.parse() {
                config.session.max_write_attempts = val;
            }
        }
        if let Some(val) = lookup("PEERLINK_MAX_HANDSHAKE_ATTEMPTS") {
            if let Ok(val) = val.parse() {
                config.session.max_handshake_attempts = val;
            }
        }

        // Queue settings
        if let Some(val) = lookup("PEERLINK_QUEUE_CAPACITY") {
            if let Ok(val) = val.parse() {
                config.queue.capacity_per_session = val;
            }
        }

        // Logging settings
        if let Some(level) = lookup("PEERLINK_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(val) = lookup("PEERLINK_LOG_JSON") {
            if let Ok(val) = val.parse() {
                config.logging.json = val;
            }
        }

        config
    }

    /// Merge with another config (other takes precedence where it differs
    /// from the defaults)
    pub fn merge(self, other: Self) -> Self {
        let session_default = SessionConfig::default();
        let queue_default = QueueConfig::default();
        let logging_default = LoggingConfig::default();

        fn pick<T: PartialEq>(base: T, other: T, default: &T) -> T {
            if &other != default {
                other
            } else {
                base
            }
        }

        Self {
            session: SessionConfig {
                supported_modes: pick(
                    self.session.supported_modes,
                    other.session.supported_modes,
                    &session_default.supported_modes,
                ),
                handshake_timeout_ms: pick(
                    self.session.handshake_timeout_ms,
                    other.session.handshake_timeout_ms,
                    &session_default.handshake_timeout_ms,
                ),
                max_write_attempts: pick(
                    self.session.max_write_attempts,
                    other.session.max_write_attempts,
                    &session_default.max_write_attempts,
                ),
                max_handshake_attempts: pick(
                    self.session.max_handshake_attempts,
                    other.session.max_handshake_attempts,
                    &session_default.max_handshake_attempts,
                ),
            },
            queue: QueueConfig {
                capacity_per_session: pick(
                    self.queue.capacity_per_session,
                    other.queue.capacity_per_session,
                    &queue_default.capacity_per_session,
                ),
            },
            logging: LoggingConfig {
                level: pick(self.logging.level, other.logging.level, &logging_default.level),
                json: pick(self.logging.json, other.logging.json, &logging_default.json),
            },
        }
    }

    /// Load from `path` (or the default location, if it exists) and apply
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(path)?,
                _ => Self::default(),
            },
        };

        let config = base.merge(Self::from_env());
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session manager cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.session.supported_modes.is_empty() {
            return Err(LinkError::InvalidModeList(
                "session.supported_modes must not be empty".to_string(),
            ));
        }
        if self.session.handshake_timeout_ms == 0 {
            return Err(LinkError::Config(
                "session.handshake_timeout_ms must be positive".to_string(),
            ));
        }
        if self.session.max_write_attempts == 0 {
            return Err(LinkError::Config(
                "session.max_write_attempts must be at least 1".to_string(),
            ));
        }
        if self.session.max_handshake_attempts == 0 {
            return Err(LinkError::Config(
                "session.max_handshake_attempts must be at least 1".to_string(),
            ));
        }
        if self.queue.capacity_per_session == 0 {
            return Err(LinkError::Config(
                "queue.capacity_per_session must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("peerlink").join("config.toml"))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LinkError::Config(e.to_string()))
    }
}

/// Handshake and store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Modes offered or accepted, in preference order
    pub supported_modes: Vec<ProtocolMode>,

    /// Time allowed for an in-flight handshake before it expires
    pub handshake_timeout_ms: u64,

    /// Optimistic write attempts per read-modify-write
    pub max_write_attempts: u32,

    /// Handshake attempts per relationship before queued messages fail
    pub max_handshake_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            supported_modes: ProtocolMode::ALL.to_vec(),
            handshake_timeout_ms: 10_000,
            max_write_attempts: 5,
            max_handshake_attempts: 3,
        }
    }
}

impl SessionConfig {
    /// Handshake timeout as a chrono duration
    pub fn handshake_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.handshake_timeout_ms).unwrap_or(i64::MAX))
    }
}

/// Outbound queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Messages held per session id before enqueue fails with backpressure
    pub capacity_per_session: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity_per_session: DEFAULT_CAPACITY_PER_SESSION,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (`RUST_LOG` overrides)
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.supported_modes, ProtocolMode::ALL.to_vec());
        assert_eq!(config.session.max_write_attempts, 5);
        assert_eq!(config.queue.capacity_per_session, DEFAULT_CAPACITY_PER_SESSION);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [session]
            supported_modes = ["aes256-gcm", "authentication-only"]
            handshake_timeout_ms = 2500
            max_write_attempts = 8
            max_handshake_attempts = 2

            [queue]
            capacity_per_session = 16
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.session.supported_modes,
            vec![ProtocolMode::Aes256Gcm, ProtocolMode::AuthenticationOnly]
        );
        assert_eq!(config.session.handshake_timeout_ms, 2500);
        assert_eq!(config.queue.capacity_per_session, 16);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]").unwrap();
        writeln!(file, "supported_modes = [\"chacha20-poly1305\"]").unwrap();
        writeln!(file, "handshake_timeout_ms = 100").unwrap();
        writeln!(file, "max_write_attempts = 3").unwrap();
        writeln!(file, "max_handshake_attempts = 1").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.session.handshake_timeout_ms, 100);
        assert!(Config::from_file("/nonexistent/peerlink.toml").is_err());
    }

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("PEERLINK_SUPPORTED_MODES", "aes,chacha"),
            ("PEERLINK_MAX_WRITE_ATTEMPTS", "9"),
            ("PEERLINK_QUEUE_CAPACITY", "not-a-number"),
            ("PEERLINK_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_vars(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(
            config.session.supported_modes,
            vec![ProtocolMode::Aes256Gcm, ProtocolMode::ChaCha20Poly1305]
        );
        assert_eq!(config.session.max_write_attempts, 9);
        assert_eq!(config.queue.capacity_per_session, DEFAULT_CAPACITY_PER_SESSION);
        assert!(config.logging.json);
    }

    #[test]
    fn test_merge_prefers_non_default() {
        let mut file_config = Config::default();
        file_config.session.handshake_timeout_ms = 500;
        file_config.queue.capacity_per_session = 4;

        let mut env_config = Config::default();
        env_config.queue.capacity_per_session = 8;

        let merged = file_config.merge(env_config);
        assert_eq!(merged.session.handshake_timeout_ms, 500);
        assert_eq!(merged.queue.capacity_per_session, 8);
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.session.supported_modes.clear();
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidModeList(_))
        ));

        let mut config = Config::default();
        config.session.max_write_attempts = 0;
        assert!(matches!(config.validate(), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_toml_output_parses_back() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
