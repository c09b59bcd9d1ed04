//! Service configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bluedroid_core::{BtleOptions, SamplingPlan};
use bluedroid_types::{ChannelKind, MAX_SAMPLING_RATE_HZ, sampling_period};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sampling rates.
    pub sampling: SamplingConfig,
    /// Which channels are sampled.
    pub channels: ChannelsConfig,
    /// Where samples are written.
    pub storage: StorageConfig,
    /// Per-peripheral behavior.
    pub peripheral: PeripheralConfig,
    /// BLE driver settings.
    pub ble: BleConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// This checks:
    /// - Sampling rates are between 1 and 1000 Hz
    /// - The storage directory and file names are not empty
    /// - Enabled channels write to distinct files
    /// - Configured characteristic UUIDs parse
    ///
    /// # Example
    ///
    /// ```
    /// use bluedroid_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.sampling.validate());
        errors.extend(self.storage.validate(&self.channels));
        errors.extend(self.ble.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Enabled channels with their log file names.
    pub fn log_files(&self) -> Vec<(ChannelKind, String)> {
        self.channels
            .enabled()
            .into_iter()
            .map(|channel| (channel, self.storage.file_name(channel).to_string()))
            .collect()
    }

    /// Polling plan for every enabled channel.
    ///
    /// Channels whose rate is out of range are left out; [`Config::validate`]
    /// reports them.
    pub fn sampling_plan(&self) -> SamplingPlan {
        self.channels
            .enabled()
            .into_iter()
            .filter_map(|channel| {
                sampling_period(self.sampling.rate_hz(channel)).map(|period| (channel, period))
            })
            .fold(SamplingPlan::new(), |plan, (channel, period)| {
                plan.channel(channel, period)
            })
    }
}

/// Sampling rates, in Hz.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub accelerometer_hz: u32,
    pub rssi_hz: u32,
    pub battery_hz: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            accelerometer_hz: 60,
            rssi_hz: 60,
            battery_hz: 1,
        }
    }
}

impl SamplingConfig {
    pub fn rate_hz(&self, channel: ChannelKind) -> u32 {
        match channel {
            ChannelKind::Accelerometer => self.accelerometer_hz,
            ChannelKind::Rssi => self.rssi_hz,
            ChannelKind::Battery => self.battery_hz,
            _ => 0,
        }
    }

    /// Validate sampling rates.
    pub fn validate(&self) -> Vec<ValidationError> {
        ChannelKind::ALL
            .iter()
            .filter(|channel| sampling_period(self.rate_hz(**channel)).is_none())
            .map(|channel| ValidationError {
                field: format!("sampling.{}_hz", channel.as_str()),
                message: format!(
                    "rate {} Hz is out of range (1 - {} Hz)",
                    self.rate_hz(*channel),
                    MAX_SAMPLING_RATE_HZ
                ),
            })
            .collect()
    }
}

/// Per-channel enable flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub accelerometer: bool,
    pub rssi: bool,
    pub battery: bool,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            accelerometer: true,
            rssi: true,
            battery: false,
        }
    }
}

impl ChannelsConfig {
    pub fn is_enabled(&self, channel: ChannelKind) -> bool {
        match channel {
            ChannelKind::Accelerometer => self.accelerometer,
            ChannelKind::Rssi => self.rssi,
            ChannelKind::Battery => self.battery,
            _ => false,
        }
    }

    /// Enabled channels, in a fixed order.
    pub fn enabled(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL
            .into_iter()
            .filter(|channel| self.is_enabled(*channel))
            .collect()
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory the sample logs are written to.
    pub directory: PathBuf,
    pub accelerometer_file: String,
    pub rssi_file: String,
    pub battery_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_storage_dir(),
            accelerometer_file: "accelerometer.csv".to_string(),
            rssi_file: "rssi.csv".to_string(),
            battery_file: "battery.csv".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn file_name(&self, channel: ChannelKind) -> &str {
        match channel {
            ChannelKind::Accelerometer => &self.accelerometer_file,
            ChannelKind::Rssi => &self.rssi_file,
            ChannelKind::Battery => &self.battery_file,
            _ => "",
        }
    }

    /// Validate storage configuration against the enabled channels.
    pub fn validate(&self, channels: &ChannelsConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.directory.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.directory".to_string(),
                message: "directory cannot be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for channel in channels.enabled() {
            let field = format!("storage.{}_file", channel.as_str());
            let name = self.file_name(channel);
            if name.trim().is_empty() {
                errors.push(ValidationError {
                    field,
                    message: "file name cannot be empty".to_string(),
                });
            } else if name.contains('/') || name.contains('\\') {
                errors.push(ValidationError {
                    field,
                    message: format!("file name '{}' must not contain a path separator", name),
                });
            } else if !seen.insert(name) {
                errors.push(ValidationError {
                    field,
                    message: format!("file name '{}' is used by another channel", name),
                });
            }
        }

        errors
    }
}

/// Per-peripheral behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Light the indicator LED while connected.
    pub indicator: bool,
}

/// BLE driver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Scan duration in seconds.
    pub scan_duration: u64,
    /// Only connect to peripherals whose name starts with this.
    pub name_prefix: Option<String>,
    /// Vendor accelerometer characteristic UUID.
    pub accelerometer_characteristic: Option<String>,
    /// Multiplier from raw accelerometer units to g.
    pub accelerometer_scale: f64,
    /// Vendor indicator LED characteristic UUID.
    pub indicator_characteristic: Option<String>,
}

/// Minimum scan duration in seconds.
pub const MIN_SCAN_DURATION: u64 = 1;
/// Maximum scan duration in seconds (5 minutes).
pub const MAX_SCAN_DURATION: u64 = 300;

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_duration: 10,
            name_prefix: None,
            accelerometer_characteristic: None,
            accelerometer_scale: 1.0,
            indicator_characteristic: None,
        }
    }
}

impl BleConfig {
    /// Validate BLE configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(MIN_SCAN_DURATION..=MAX_SCAN_DURATION).contains(&self.scan_duration) {
            errors.push(ValidationError {
                field: "ble.scan_duration".to_string(),
                message: format!(
                    "scan duration {} is out of range ({} - {} seconds)",
                    self.scan_duration, MIN_SCAN_DURATION, MAX_SCAN_DURATION
                ),
            });
        }

        if !self.accelerometer_scale.is_finite() || self.accelerometer_scale == 0.0 {
            errors.push(ValidationError {
                field: "ble.accelerometer_scale".to_string(),
                message: "scale must be a finite, non-zero number".to_string(),
            });
        }

        for (field, value) in [
            ("ble.accelerometer_characteristic", &self.accelerometer_characteristic),
            ("ble.indicator_characteristic", &self.indicator_characteristic),
        ] {
            if let Some(value) = value
                && Uuid::parse_str(value).is_err()
            {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!("'{}' is not a valid UUID", value),
                });
            }
        }

        errors
    }

    /// Driver options. Unparseable UUIDs are treated as unset.
    pub fn to_options(&self) -> BtleOptions {
        let parse = |value: &Option<String>| value.as_deref().and_then(|s| Uuid::parse_str(s).ok());
        BtleOptions {
            scan_duration: Duration::from_secs(self.scan_duration),
            name_prefix: self.name_prefix.clone(),
            accelerometer_characteristic: parse(&self.accelerometer_characteristic),
            accelerometer_scale: self.accelerometer_scale,
            indicator_characteristic: parse(&self.indicator_characteristic),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `sampling.rssi_hz`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bluedroid")
        .join("service.toml")
}

/// Default sample log directory: `Downloads/bluedroid`.
pub fn default_storage_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bluedroid")
}
