//! Configuration using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults (every field has one)
//! 2. a TOML file, `config/potentiostat.toml` unless another path is given
//! 3. environment variables prefixed with `POTENTIOSTAT_`, with `__` between
//!    section and key, e.g. `POTENTIOSTAT_SERVER__PORT=7000`
//!
//! Command-line flags are applied on top by the binary.
//!
//! # Example
//! ```no_run
//! use potentiostat_daq::config::AppConfig;
//!
//! # fn main() -> potentiostat_daq::DaqResult<()> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("serving on {}", config.server.bind_address());
//! # Ok(())
//! # }
//! ```

use crate::device::{ConnectOptions, MockConfig};
use crate::error::{DaqError, DaqResult};
use crate::network::protocol::DEFAULT_MAX_FRAME_LEN;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/potentiostat.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub instrument: InstrumentConfig,
    pub logging: LoggingConfig,
}

/// Job server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Number of channel locks; jobs naming a channel above it are refused.
    pub max_channels: usize,
    /// Largest accepted message body in bytes.
    pub max_frame_len: usize,
    /// Pause between polls while a channel has no new data, in milliseconds.
    pub data_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6001,
            max_channels: 4,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            data_wait_ms: 100,
        }
    }
}

impl ServerConfig {
    /// `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Instrument connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Address used by jobs that do not name one.
    pub default_address: String,
    pub connect_timeout_secs: u64,
    pub force_firmware_load: bool,
    pub message_poll_interval_ms: u64,
    pub listener_join_timeout_ms: u64,
    /// Simulated instrument used by `serve --mock`.
    pub mock: MockConfig,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            default_address: "USB0".to_string(),
            connect_timeout_secs: 5,
            force_firmware_load: false,
            message_poll_interval_ms: 1000,
            listener_join_timeout_ms: 5000,
            mock: MockConfig::default(),
        }
    }
}

impl InstrumentConfig {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            timeout: Duration::from_secs(self.connect_timeout_secs),
            force_load: self.force_firmware_load,
            message_poll_interval: Duration::from_millis(self.message_poll_interval_ms),
            listener_join_timeout: Duration::from_millis(self.listener_join_timeout_ms),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored output for development.
    Pretty,
    /// One line per event, no colors.
    Compact,
    /// JSON objects for log aggregation.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Loads the default file (if present) and the environment.
    pub fn load() -> DaqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads `path` (if present) and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("POTENTIOSTAT_").split("__"))
            .extract()?)
    }

    /// Checks values serde cannot check.
    pub fn validate(&self) -> DaqResult<()> {
        if !VALID_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }
        if self.server.max_channels == 0 {
            return Err(DaqError::Configuration(
                "server.max_channels must be at least 1".to_string(),
            ));
        }
        if self.server.max_frame_len == 0 {
            return Err(DaqError::Configuration(
                "server.max_frame_len must be at least 1".to_string(),
            ));
        }
        if self.instrument.default_address.trim().is_empty() {
            return Err(DaqError::Configuration(
                "instrument.default_address must not be empty".to_string(),
            ));
        }
        if self.instrument.message_poll_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "instrument.message_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.instrument.mock.model.family().is_none() {
            return Err(DaqError::Configuration(format!(
                "instrument.mock.model {} is not a supported device",
                self.instrument.mock.model
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceModel;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_address(), "127.0.0.1:6001");
        assert_eq!(config.server.max_frame_len, 16 * 1024 * 1024);
        assert_eq!(config.instrument.default_address, "USB0");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 6001);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 7100
max_channels = 16

[instrument]
default_address = "192.168.0.20"

[instrument.mock]
model = "SP300"
num_channels = 16

[logging]
level = "debug"
format = "json"
"#
        )
        .unwrap();
        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.server.port, 7100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.max_channels, 16);
        assert_eq!(config.instrument.default_address, "192.168.0.20");
        assert_eq!(config.instrument.mock.model, DeviceModel::Sp300);
        assert_eq!(config.instrument.mock.num_channels, 16);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));

        let mut config = AppConfig::default();
        config.server.max_channels = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.instrument.mock.model = DeviceModel::Epp400;
        assert!(config.validate().is_err());
    }

    #[test]
    fn connect_options_follow_instrument_settings() {
        let options = InstrumentConfig {
            connect_timeout_secs: 2,
            message_poll_interval_ms: 250,
            ..InstrumentConfig::default()
        }
        .connect_options();
        assert_eq!(options.timeout, Duration::from_secs(2));
        assert_eq!(options.message_poll_interval, Duration::from_millis(250));
        assert!(!options.force_load);
    }
}
