//! Host-side settings and the board's persisted configuration.
//!
//! [`Settings`] are read from a JSON file on the host; every field has a
//! default so a partial (or missing) file is fine. [`BoardConfig`] lives in the
//! board's EEPROM and is only ever read by this crate.

use crate::error::{BoardError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Settings persisted on the device itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub zstage_up_position: f64,
    pub zstage_down_position: f64,
    /// PMT control voltage in mV.
    pub pmt_control_voltage: f64,
    /// ADC sampling rate in samples per second.
    pub pmt_sampling_rate: f64,
    pub pmt_sys_offset_cal: u32,
    pub pmt_sys_gain_cal: u32,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            zstage_up_position: 16.0,
            zstage_down_position: 0.0,
            pmt_control_voltage: 800.0,
            pmt_sampling_rate: 10.0,
            pmt_sys_offset_cal: 0,
            pmt_sys_gain_cal: 0x80_0000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 2_000,
        }
    }
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            retry_count: 2,
            retry_backoff_ms: 1_000,
        }
    }
}

impl ConnectionSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedSettings {
    pub led1_brightness: f64,
    pub led2_brightness: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    pub use_auto_pump: bool,
    pub fill_frequency_hz: f64,
    pub reservoir_channel: usize,
    pub fill_timeout_ms: u64,
    pub samples_per_cycle: usize,
    pub baseline_samples: usize,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            use_auto_pump: false,
            fill_frequency_hz: 8_000.0,
            reservoir_channel: 24,
            fill_timeout_ms: 5_000,
            samples_per_cycle: 10,
            baseline_samples: 100,
        }
    }
}

impl PumpSettings {
    pub fn fill_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PmtSettings {
    pub gain_trial_reads: usize,
    pub gain_trial_rate_hz: f64,
    pub guard_time_ms: u64,
    pub reference_voltage_reads: usize,
}

impl Default for PmtSettings {
    fn default() -> Self {
        Self {
            gain_trial_reads: 10,
            gain_trial_rate_hz: 120.0,
            guard_time_ms: 1_000,
            reference_voltage_reads: 20,
        }
    }
}

impl PmtSettings {
    pub fn guard_time(&self) -> Duration {
        Duration::from_millis(self.guard_time_ms)
    }
}

/// External program used to reflash the board, e.g. `avrdude` with its
/// arguments. The serial port name is appended as the last argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareSettings {
    pub program: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub serial: SerialSettings,
    pub connection: ConnectionSettings,
    pub leds: LedSettings,
    pub pump: PumpSettings,
    pub pmt: PmtSettings,
    pub firmware: FirmwareSettings,
    pub output_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            connection: ConnectionSettings::default(),
            leds: LedSettings::default(),
            pump: PumpSettings::default(),
            pmt: PmtSettings::default(),
            firmware: FirmwareSettings::default(),
            output_dir: PathBuf::from("logs"),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&text)?;
        settings.validate()?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("led1_brightness", self.leds.led1_brightness),
            ("led2_brightness", self.leds.led2_brightness),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(BoardError::InvalidOption(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.connection.retry_count == 0 {
            return Err(BoardError::InvalidOption("retry_count must be at least 1".into()));
        }
        if self.pump.samples_per_cycle == 0 || self.pmt.gain_trial_reads == 0 {
            return Err(BoardError::InvalidOption("sample counts must be non-zero".into()));
        }
        Ok(())
    }
}
