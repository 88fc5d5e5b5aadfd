//! Configuration management
//!
//! A TOML file (all sections optional) layered with `CHARSYNC_<SECTION>_<KEY>`
//! environment overrides, validated before use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::remote::Endpoint;

mod error;

pub use error::ConfigError;

/// Default coordination service
pub const MAIN_SERVICE_URI: &str = "tcp://127.0.0.1:6900";

/// Size of one upload chunk on the transfer channel
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub transfer: TransferConfig,
    pub detector: DetectorConfig,
    pub logging: LoggingConfig,
}

/// Which coordination service to talk to, and the secrets issued by each
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub main_uri: String,
    pub custom_uri: Option<String>,
    pub use_custom_service: bool,
    /// Secret per service URI, as handed out by `register`
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Attempts per connect or reconnect before giving up
    pub handshake_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,

    /// Chunks buffered between the producer and the transfer channel
    pub channel_capacity: usize,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound on waiting for the service to assemble an upload batch
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Where downloaded content and the content index live
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub connect_attempts: u32,

    /// First wait between connectivity checks; doubles per attempt up to 8x
    #[serde(with = "humantime_serde")]
    pub connect_retry_delay: Duration,

    pub ready_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub ready_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub json_format: bool,
    pub with_target: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            main_uri: MAIN_SERVICE_URI.to_string(),
            custom_uri: None,
            use_custom_service: false,
            secrets: BTreeMap::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_attempts: 5,
            retry_delay: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            channel_capacity: 4,
            poll_interval: Duration::from_millis(500),
            poll_timeout: Duration::from_secs(300),
            cache_dir: PathBuf::from("./cache"),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            connect_retry_delay: Duration::from_secs(1),
            ready_attempts: 100,
            ready_delay: Duration::from_millis(50),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

impl ServerConfig {
    /// The URI currently selected, honoring `use_custom_service`
    pub fn active_uri(&self) -> &str {
        match (&self.custom_uri, self.use_custom_service) {
            (Some(uri), true) => uri,
            _ => &self.main_uri,
        }
    }

    pub fn secret(&self) -> Option<&str> {
        self.secrets.get(self.active_uri()).map(String::as_str)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.active_uri(), self.secret().map(str::to_string))
    }

    pub fn set_secret(&mut self, secret: impl Into<String>) {
        let uri = self.active_uri().to_string();
        self.secrets.insert(uri, secret.into());
    }
}

impl Config {
    /// Defaults overlaid with environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(uri) = env::var("CHARSYNC_SERVER_URI") {
            self.server.main_uri = uri;
        }
        if let Ok(uri) = env::var("CHARSYNC_SERVER_CUSTOM_URI") {
            self.server.custom_uri = Some(uri);
            self.server.use_custom_service = true;
        }
        if let Ok(secret) = env::var("CHARSYNC_SERVER_SECRET") {
            self.server.set_secret(secret);
        }
        if let Ok(attempts) = env::var("CHARSYNC_SESSION_HANDSHAKE_ATTEMPTS") {
            self.session.handshake_attempts =
                attempts.parse().map_err(|e| ConfigError::InvalidEnv {
                    var: "CHARSYNC_SESSION_HANDSHAKE_ATTEMPTS",
                    message: format!("{}", e),
                })?;
        }
        if let Ok(timeout) = env::var("CHARSYNC_SESSION_RPC_TIMEOUT") {
            self.session.rpc_timeout = humantime_serde::re::humantime::parse_duration(&timeout)
                .map_err(|e| ConfigError::InvalidEnv {
                    var: "CHARSYNC_SESSION_RPC_TIMEOUT",
                    message: e.to_string(),
                })?;
        }
        if let Ok(dir) = env::var("CHARSYNC_TRANSFER_CACHE_DIR") {
            self.transfer.cache_dir = PathBuf::from(dir);
        }
        if let Ok(level) = env::var("CHARSYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = env::var("CHARSYNC_LOG_JSON") {
            self.logging.json_format = json
                .parse()
                .map_err(|e: std::str::ParseBoolError| ConfigError::InvalidEnv {
                    var: "CHARSYNC_LOG_JSON",
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.active_uri().is_empty() {
            return Err(ConfigError::Invalid(
                "service URI must not be empty".to_string(),
            ));
        }

        if self.server.use_custom_service && self.server.custom_uri.is_none() {
            return Err(ConfigError::Invalid(
                "use_custom_service is set but custom_uri is missing".to_string(),
            ));
        }

        if self.session.handshake_attempts == 0 {
            return Err(ConfigError::Invalid(
                "handshake_attempts must be greater than 0".to_string(),
            ));
        }

        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.transfer.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.transfer.poll_interval.is_zero()
            || self.transfer.poll_timeout < self.transfer.poll_interval
        {
            return Err(ConfigError::Invalid(
                "poll_timeout must be at least one non-zero poll_interval".to_string(),
            ));
        }

        if self.detector.connect_attempts == 0 || self.detector.ready_attempts == 0 {
            return Err(ConfigError::Invalid(
                "detector attempt budgets must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "warning", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Encode(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transfer.chunk_size, 512 * 1024);
        assert_eq!(config.server.active_uri(), MAIN_SERVICE_URI);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.session.handshake_attempts = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.server.use_custom_service = true;
        assert!(config.validate().is_err());

        config = Config::default();
        config.transfer.poll_timeout = Duration::from_millis(10);
        assert!(config.validate().is_err());

        config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_follows_active_uri() {
        let mut server = ServerConfig::default();
        server.set_secret("main-secret");
        server.custom_uri = Some("tcp://10.0.0.2:7000".to_string());
        server.use_custom_service = true;
        assert_eq!(server.secret(), None);

        server.set_secret("custom-secret");
        assert_eq!(server.endpoint().secret.as_deref(), Some("custom-secret"));

        server.use_custom_service = false;
        assert_eq!(server.endpoint().uri, MAIN_SERVICE_URI);
        assert_eq!(server.secret(), Some("main-secret"));
    }

    #[test]
    fn test_file_roundtrip_with_partial_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("charsync.toml");
        std::fs::write(
            &path,
            "[transfer]\nchannel_capacity = 8\npoll_interval = \"250ms\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.transfer.channel_capacity, 8);
        assert_eq!(config.transfer.poll_interval, Duration::from_millis(250));
        assert_eq!(config.session.handshake_attempts, 5);

        let mut config = config;
        config.server.set_secret("abc");
        config.save_to_file(&path).unwrap();
        let reloaded = Config::from_file(&path).unwrap();
        assert_eq!(reloaded.server.secret(), Some("abc"));
    }

    #[test]
    fn test_unreadable_file_names_the_path() {
        let dir = tempdir().unwrap();
        let err = Config::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }
}
