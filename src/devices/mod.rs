//! Hardware surface of the MR-Box peripheral board.
//!
//! Each subsystem is its own trait so the controllers only depend on what they
//! drive. [`Board`] ties them together with the session-level operations of an
//! open serial connection. Firmware differences are reported through
//! [`Capabilities`] rather than separate board types.

pub mod firmware;
pub mod mock;
pub mod mrbox;

use crate::config::BoardConfig;
use crate::error::{BoardError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use firmware::{CommandFlasher, FirmwareFlasher};
pub use mrbox::{MrBox, SerialConnector};

/// Full-scale reading of the 24 bit ADC.
pub const ADC_FULL_SCALE: u32 = (1 << 24) - 1;

/// PMT control voltage that maps to the top digipot step, in mV.
pub const PMT_DIGIPOT_MAX_MV: f64 = 1100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Led {
    One,
    Two,
}

impl Led {
    pub const ALL: [Led; 2] = [Led::One, Led::Two];

    pub fn index(self) -> u8 {
        match self {
            Led::One => 1,
            Led::Two => 2,
        }
    }
}

/// Programmable digital gain of the ADC front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AdcGain {
    X1 = 1,
    X2 = 2,
    X4 = 4,
    X8 = 8,
    X16 = 16,
}

impl AdcGain {
    pub const MAX: AdcGain = AdcGain::X16;

    pub fn value(self) -> u8 {
        self as u8
    }

    /// Next lower gain, or `None` at unity.
    pub fn halve(self) -> Option<AdcGain> {
        match self {
            AdcGain::X16 => Some(AdcGain::X8),
            AdcGain::X8 => Some(AdcGain::X4),
            AdcGain::X4 => Some(AdcGain::X2),
            AdcGain::X2 => Some(AdcGain::X1),
            AdcGain::X1 => None,
        }
    }
}

impl TryFrom<u8> for AdcGain {
    type Error = BoardError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(AdcGain::X1),
            2 => Ok(AdcGain::X2),
            4 => Ok(AdcGain::X4),
            8 => Ok(AdcGain::X8),
            16 => Ok(AdcGain::X16),
            other => Err(BoardError::InvalidOption(format!(
                "ADC gain must be one of 1, 2, 4, 8, 16, got {}",
                other
            ))),
        }
    }
}

impl From<AdcGain> for u8 {
    fn from(gain: AdcGain) -> u8 {
        gain.value()
    }
}

impl fmt::Display for AdcGain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input = 0,
    Output = 1,
}

/// Feature set of the connected firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub led_brightness: bool,
    pub pmt_reference_voltage: bool,
    pub shutter_pin: u8,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            led_brightness: true,
            pmt_reference_voltage: true,
            shutter_pin: 9,
        }
    }
}

/// Snapshot of the ADC calibration registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdcCalibration {
    pub self_cal_offset: u32,
    pub self_cal_gain: u32,
    pub sys_offset_cal: u32,
    pub sys_gain_cal: u32,
}

pub trait ZStage {
    /// Blocks until the homing move has finished.
    fn zstage_home(&mut self) -> Result<()>;
    fn zstage_move_to(&mut self, position: f64) -> Result<()>;
    fn zstage_position(&mut self) -> Result<f64>;
    /// State of the home end-stop switch.
    fn zstage_is_down(&mut self) -> Result<bool>;
}

pub trait Pump {
    fn pump_activate(&mut self) -> Result<()>;
    fn pump_deactivate(&mut self) -> Result<()>;
    fn pump_set_frequency(&mut self, frequency_hz: f64) -> Result<()>;
}

pub trait PmtShutter {
    fn pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<()>;
    fn pmt_open_shutter(&mut self) -> Result<()>;
    fn pmt_close_shutter(&mut self) -> Result<()>;
    fn pmt_set_pot(&mut self, steps: u8) -> Result<()>;
    /// PMT reference voltage in volts.
    fn pmt_reference_voltage(&mut self) -> Result<f64>;
}

pub trait Adc {
    /// Start the ADC and run its self calibration.
    fn adc_begin(&mut self) -> Result<()>;
    fn adc_self_cal_gain(&mut self) -> Result<u32>;
    fn adc_set_self_cal_gain(&mut self, value: u32) -> Result<()>;
    fn adc_self_cal_offset(&mut self) -> Result<u32>;
    fn adc_set_self_cal_offset(&mut self, value: u32) -> Result<()>;
    fn adc_set_sys_offset_cal(&mut self, value: u32) -> Result<()>;
    fn adc_set_sys_gain_cal(&mut self, value: u32) -> Result<()>;
    fn adc_set_gain(&mut self, gain: AdcGain) -> Result<()>;
    fn adc_calibration(&mut self) -> Result<AdcCalibration>;
    /// Read `count` conversions at `rate_hz`. Blocks for roughly
    /// `count / rate_hz` seconds on real hardware.
    fn adc_read(&mut self, rate_hz: f64, count: usize) -> Result<Vec<u32>>;
}

pub trait Leds {
    fn led_on(&mut self, led: Led) -> Result<bool>;
    fn set_led_on(&mut self, led: Led, on: bool) -> Result<()>;
    fn led_brightness(&mut self, led: Led) -> Result<f64>;
    fn set_led_brightness(&mut self, led: Led, brightness: f64) -> Result<()>;
}

/// An open session with the board. Only one may exist per process.
pub trait Board: ZStage + Pump + PmtShutter + Adc + Leds + Send {
    fn port(&self) -> &str;
    fn capabilities(&self) -> Capabilities;
    fn config(&mut self) -> Result<BoardConfig>;
    fn properties(&mut self) -> Result<BTreeMap<String, String>>;
    /// Version of the driver this host was built against.
    fn host_software_version(&self) -> String;
    fn remote_software_version(&mut self) -> Result<String>;
    fn close(&mut self) -> Result<()>;
}

/// Opens fresh board sessions.
pub trait BoardConnector: Send {
    fn connect(&mut self) -> Result<Box<dyn Board>>;
}

/// Ambient conditions reported by the droplet controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub temperature_celsius: f64,
    /// Fraction in [0, 1].
    pub relative_humidity: f64,
}

/// Capacitance readout of the droplet controller, used as a reservoir fill
/// level sensor.
pub trait CapacitanceSensor: Send {
    /// Actuate only `channel`, releasing all others.
    fn select_channel(&mut self, channel: usize) -> Result<()>;
    fn release_channels(&mut self) -> Result<()>;
    /// Capacitance in farads.
    fn measure_capacitance(&mut self) -> Result<f64>;

    /// Temperature and humidity, if the controller has the sensors.
    fn environment(&mut self) -> Result<Option<Environment>> {
        Ok(None)
    }
}

/// Digipot steps for a PMT control voltage in mV.
pub fn pmt_digipot_steps(control_voltage_mv: f64) -> u8 {
    let steps = (control_voltage_mv / PMT_DIGIPOT_MAX_MV * 255.0).round();
    steps.clamp(0.0, 255.0) as u8
}
