//! TOML-based configuration for Pedal-Link.
//!
//! Reads `AppConfig` from the platform-appropriate config file:
//! - Windows:  `%APPDATA%\PedalLink\config.toml`
//! - Linux:    `~/.config/pedal-link/config.toml`
//! - macOS:    `~/Library/Application Support/PedalLink/config.toml`
//!
//! Every field has a default, so a missing file, a missing section and a
//! missing key all mean "use the default":
//!
//! ```toml
//! [general]
//! log_level = "info"
//!
//! [connection]
//! health_interval_ms = 2500
//! degraded_threshold_ms = 200
//!
//! [midi]
//! output_name = "DL4"
//! channel = 1
//! clock_bpm = 120.0
//!
//! [transport]
//! mode = "auto"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use pedal_link_core::midi::messages::clamp_channel;
use pedal_link_core::{BackoffPolicy, DEFAULT_LOG_CAPACITY};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::connection_service::ServiceConfig;
use crate::infrastructure::transport::{OutputSelector, TransportMode};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level application configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub connection: ConnectionConfig,
    pub midi: MidiConfig,
    pub transport: TransportConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Connection state machine tuning, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_degraded_threshold_ms")]
    pub degraded_threshold_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Which MIDI ports to use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MidiConfig {
    /// Name this process registers with the MIDI system.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Output index, used when `output_name` is unset or matches nothing.
    #[serde(default)]
    pub output_index: usize,
    /// Case-insensitive substring of the output name to prefer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    /// Channel (1-16) for messages sent from the command line.  Read it
    /// through [`MidiConfig::channel`].
    #[serde(default = "default_channel")]
    pub channel: u8,
    /// Input to listen on; no inbound logging when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_index: Option<usize>,
    /// Tempo of MIDI clock sent while linked; no clock when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_bpm: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default)]
    pub mode: TransportMode,
    #[serde(default = "default_bridge_call_timeout_ms")]
    pub bridge_call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_health_interval_ms() -> u64 {
    2500
}
fn default_degraded_threshold_ms() -> u64 {
    200
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    15_000
}
fn default_client_name() -> String {
    "Pedal-Link".to_string()
}
fn default_channel() -> u8 {
    1
}
fn default_bridge_call_timeout_ms() -> u64 {
    1000
}
fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: default_health_interval_ms(),
            degraded_threshold_ms: default_degraded_threshold_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            output_index: 0,
            output_name: None,
            channel: default_channel(),
            input_index: None,
            clock_bpm: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            bridge_call_timeout_ms: default_bridge_call_timeout_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl ConnectionConfig {
    /// Service tuning from these settings.  Zero intervals are raised to
    /// 1 ms; a cap below the base is raised to the base.
    pub fn service_config(&self) -> ServiceConfig {
        let ms = |v: u64| Duration::from_millis(v.max(1));
        let base = ms(self.backoff_base_ms);
        ServiceConfig {
            health_interval: ms(self.health_interval_ms),
            degraded_threshold: Duration::from_millis(self.degraded_threshold_ms),
            probe_timeout: ms(self.probe_timeout_ms),
            backoff: BackoffPolicy::new(base, ms(self.backoff_max_ms).max(base)),
        }
    }
}

impl MidiConfig {
    /// The configured channel clamped to 1-16.
    pub fn channel(&self) -> u8 {
        clamp_channel(self.channel)
    }

    pub fn output_selector(&self) -> OutputSelector {
        OutputSelector {
            index: self.output_index,
            name: self.output_name.clone(),
        }
    }
}

impl TransportConfig {
    pub fn bridge_call_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_call_timeout_ms.max(1))
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Loads `AppConfig` from the platform config file.
///
/// # Errors
///
/// As [`load_config_from`], plus [`ConfigError::NoPlatformConfigDir`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config directory including the app subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("PedalLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("pedal-link"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("PedalLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("pedal_link_test_{}", uuid::Uuid::new_v4()))
            .join("config.toml")
    }

    #[test]
    fn test_default_connection_config_matches_service_defaults() {
        // Arrange / Act
        let service = ConnectionConfig::default().service_config();

        // Assert
        assert_eq!(service, ServiceConfig::default());
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.log.capacity, 1000);
        assert_eq!(cfg.transport.mode, TransportMode::Auto);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        // Arrange
        let toml_str = r#"
[connection]
degraded_threshold_ms = 350

[midi]
output_name = "DL4"
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.connection.degraded_threshold_ms, 350);
        assert_eq!(cfg.connection.health_interval_ms, 2500);
        assert_eq!(cfg.midi.output_name.as_deref(), Some("DL4"));
        assert_eq!(cfg.midi.channel, 1);
    }

    #[test]
    fn test_out_of_range_channel_is_clamped() {
        // Arrange
        let high: AppConfig = toml::from_str("[midi]\nchannel = 17").expect("deserialize");
        let low: AppConfig = toml::from_str("[midi]\nchannel = 0").expect("deserialize");

        // Act / Assert
        assert_eq!(high.midi.channel(), 16);
        assert_eq!(low.midi.channel(), 1);
        assert_eq!(MidiConfig::default().channel(), 1);
    }

    #[test]
    fn test_clock_bpm_is_optional() {
        let cfg: AppConfig = toml::from_str("[midi]\nclock_bpm = 98.5").expect("deserialize");
        assert_eq!(cfg.midi.clock_bpm, Some(98.5));
        assert_eq!(AppConfig::default().midi.clock_bpm, None);
    }

    #[test]
    fn test_backoff_cap_below_base_is_raised() {
        let cfg = ConnectionConfig {
            backoff_base_ms: 2000,
            backoff_max_ms: 500,
            ..ConnectionConfig::default()
        };
        let policy = cfg.service_config().backoff;
        assert_eq!(policy.max, Duration::from_millis(2000));
    }

    #[test]
    fn test_unset_optionals_are_omitted_from_toml() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        assert!(!toml_str.contains("output_name"));
        assert!(!toml_str.contains("input_index"));
        assert!(!toml_str.contains("clock_bpm"));
    }

    #[test]
    fn test_invalid_transport_mode_is_a_parse_error() {
        let result: Result<AppConfig, _> = toml::from_str("[transport]\nmode = \"usb\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let cfg = load_config_from(Path::new("/nonexistent/pedal-link/config.toml")).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        // Arrange
        let path = temp_path();
        let mut cfg = AppConfig::default();
        cfg.midi.output_index = 2;
        cfg.transport.mode = TransportMode::Bridge;

        // Act
        save_config_to(&path, &cfg).expect("save");
        let loaded = load_config_from(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("config.toml"), "got {path:?}");
        }
    }
}
