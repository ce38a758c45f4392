//! Experiment configuration.
//!
//! Configuration lives in a JSON file (`photocal.json` by default). A
//! missing file is created with defaults so a fresh lab machine can run
//! straight away; an invalid file is fatal at startup, before any hardware
//! is touched.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use photocal_core::{StaircaseConfig, StaircaseError};

/// Default configuration file name, resolved relative to the working
/// directory unless `--config` overrides it.
pub const DEFAULT_CONFIG_FILE: &str = "photocal.json";

/// Fastest permitted response poll, in milliseconds.
pub const POLL_INTERVAL_MIN_MS: u64 = 1;

/// Slowest permitted response poll; the abort latency bound.
pub const POLL_INTERVAL_MAX_MS: u64 = 100;

// ============================================================================
// Error Types
// ============================================================================

/// Errors loading or validating the configuration. All fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for the expected schema.
    #[error("invalid JSON in config {}: {source}", path.display())]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// Default configuration file could not be written.
    #[error("failed to create default config {}: {source}", path.display())]
    WriteDefault {
        /// File that was being created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be serialized back to JSON.
    #[error("failed to encode config: {source}")]
    Encode {
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },

    /// Staircase section rejected by the engine.
    #[error("invalid staircase parameters: {0}")]
    Staircase(#[from] StaircaseError),

    /// Pre-stimulus delay below zero.
    #[error("pre_stimulus_secs must be >= 0, got {secs}")]
    NegativePreStimulus {
        /// Configured value.
        secs: f64,
    },

    /// Stimulus duration must be strictly positive.
    #[error("stimulus_secs must be > 0, got {secs}")]
    NonPositiveStimulus {
        /// Configured value.
        secs: f64,
    },

    /// Inter-trial interval below zero.
    #[error("inter_trial_secs must be >= 0, got {secs}")]
    NegativeInterTrial {
        /// Configured value.
        secs: f64,
    },

    /// Poll interval outside the permitted band.
    #[error(
        "poll_interval_ms must be {POLL_INTERVAL_MIN_MS}-{POLL_INTERVAL_MAX_MS}, got {ms}"
    )]
    PollIntervalOutOfRange {
        /// Configured value.
        ms: u64,
    },

    /// Staircase start above what the hardware section permits.
    #[error("start intensity {start} exceeds device limit {max}")]
    StartAboveDeviceLimit {
        /// Configured start intensity.
        start: u8,
        /// Configured device limit.
        max: u8,
    },
}

// ============================================================================
// Sections
// ============================================================================

/// Serial link parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Serial port path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub serial_port: String,
    /// Baud rate of the goggle controller.
    pub baud_rate: u32,
    /// Upper brightness limit enforced by the bridge. Lab setups with
    /// sensitive subjects cap this below 255.
    pub max_brightness: u8,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            max_brightness: 255,
        }
    }
}

/// Trial phase durations and the input poll cadence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Countdown before the stimulus, seconds.
    pub pre_stimulus_secs: f64,
    /// How long the goggles hold the stimulus level, seconds.
    pub stimulus_secs: f64,
    /// Pause after the stimulus; the response window extends through it.
    pub inter_trial_secs: f64,
    /// Keystroke poll cadence during timed waits, milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pre_stimulus_secs: 6.0,
            stimulus_secs: 2.0,
            inter_trial_secs: 6.0,
            poll_interval_ms: 50,
        }
    }
}

impl TimingConfig {
    /// Pre-stimulus delay as a [`Duration`].
    #[must_use]
    pub fn pre_stimulus(&self) -> Duration {
        Duration::from_secs_f64(self.pre_stimulus_secs)
    }

    /// Stimulus hold as a [`Duration`].
    #[must_use]
    pub fn stimulus(&self) -> Duration {
        Duration::from_secs_f64(self.stimulus_secs)
    }

    /// Inter-trial interval as a [`Duration`].
    #[must_use]
    pub fn inter_trial(&self) -> Duration {
        Duration::from_secs_f64(self.inter_trial_secs)
    }

    /// Poll cadence as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Output locations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory receiving trial logs, metadata and staircase snapshots.
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("photocal-data"),
        }
    }
}

// ============================================================================
// Top Level
// ============================================================================

/// Complete experiment configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Serial link parameters.
    pub hardware: HardwareConfig,
    /// Staircase parameters, validated by the engine.
    pub staircase: StaircaseConfig,
    /// Phase durations.
    pub timing: TimingConfig,
    /// Output locations.
    pub paths: PathsConfig,
}

impl ExperimentConfig {
    /// Validate every section.
    ///
    /// # Errors
    ///
    /// The first violated constraint as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.staircase.validate()?;

        if self.staircase.start_intensity > self.hardware.max_brightness {
            return Err(ConfigError::StartAboveDeviceLimit {
                start: self.staircase.start_intensity,
                max: self.hardware.max_brightness,
            });
        }

        let timing = &self.timing;
        if timing.pre_stimulus_secs < 0.0 || !timing.pre_stimulus_secs.is_finite() {
            return Err(ConfigError::NegativePreStimulus {
                secs: timing.pre_stimulus_secs,
            });
        }
        if timing.stimulus_secs <= 0.0 || !timing.stimulus_secs.is_finite() {
            return Err(ConfigError::NonPositiveStimulus {
                secs: timing.stimulus_secs,
            });
        }
        if timing.inter_trial_secs < 0.0 || !timing.inter_trial_secs.is_finite() {
            return Err(ConfigError::NegativeInterTrial {
                secs: timing.inter_trial_secs,
            });
        }
        if !(POLL_INTERVAL_MIN_MS..=POLL_INTERVAL_MAX_MS).contains(&timing.poll_interval_ms) {
            return Err(ConfigError::PollIntervalOutOfRange {
                ms: timing.poll_interval_ms,
            });
        }

        Ok(())
    }

    /// Load the configuration, creating a default file when none exists.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] on unreadable or invalid files.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.write_to(path)?;
            info!(path = %path.display(), "created default configuration");
            return Ok(config);
        }

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Write this configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// [`ConfigError::WriteDefault`] on I/O failure.
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        let mut json = serde_json::to_string_pretty(self)
            .map_err(|source| ConfigError::Encode { source })?;
        json.push('\n');

        let io_err = |source| ConfigError::WriteDefault {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        fs::write(path, json).map_err(io_err)
    }
}

// ============================================================================
// Tests
// ============================================================================
