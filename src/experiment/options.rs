use crate::devices::AdcGain;
use crate::error::{BoardError, Result};
use serde::{Deserialize, Serialize};

/// Longest pump hold accepted for a single step, in seconds.
pub const MAX_PUMP_DURATION_S: f64 = 3_600.0;

/// Longest PMT measurement accepted for a single step, in seconds.
pub const MAX_MEASUREMENT_DURATION_S: f64 = 86_400.0;

/// Per-step board settings chosen in the protocol editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepOptions {
    pub magnet_engaged: bool,
    pub pump_enabled: bool,
    pub pump_frequency_hz: f64,
    pub pump_duration_s: f64,
    pub measure_pmt: bool,
    pub measurement_duration_s: f64,
    /// Fixed ADC gain; `None` selects the gain automatically.
    pub adc_gain: Option<AdcGain>,
    pub label: Option<String>,
}

impl Default for StepOptions {
    fn default() -> Self {
        StepOptions {
            magnet_engaged: false,
            pump_enabled: false,
            pump_frequency_hz: 1_000.0,
            pump_duration_s: 0.1,
            measure_pmt: false,
            measurement_duration_s: 10.0,
            adc_gain: None,
            label: None,
        }
    }
}

impl StepOptions {
    pub fn is_background(&self) -> bool {
        self.label
            .as_deref()
            .is_some_and(|label| label.trim().eq_ignore_ascii_case("background"))
    }

    pub fn validate_pump(&self) -> Result<()> {
        if !(self.pump_frequency_hz >= 1.0) || !self.pump_frequency_hz.is_finite() {
            return Err(BoardError::InvalidOption(format!(
                "pump frequency must be at least 1 Hz, got {}",
                self.pump_frequency_hz
            )));
        }
        if !(self.pump_duration_s >= 0.1 && self.pump_duration_s <= MAX_PUMP_DURATION_S) {
            return Err(BoardError::InvalidOption(format!(
                "pump duration must be between 0.1 s and {} s, got {}",
                MAX_PUMP_DURATION_S, self.pump_duration_s
            )));
        }
        Ok(())
    }

    pub fn validate_pmt(&self) -> Result<()> {
        if !(self.measurement_duration_s >= 0.0 && self.measurement_duration_s <= MAX_MEASUREMENT_DURATION_S) {
            return Err(BoardError::InvalidOption(format!(
                "measurement duration must be between 0 s and {} s, got {}",
                MAX_MEASUREMENT_DURATION_S, self.measurement_duration_s
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_json_uses_defaults() {
        let options: StepOptions = serde_json::from_str(r#"{ "magnet_engaged": true }"#).unwrap();
        assert!(options.magnet_engaged);
        assert!(!options.pump_enabled);
        assert_eq!(options.pump_frequency_hz, 1_000.0);
        assert_eq!(options.measurement_duration_s, 10.0);
        assert_eq!(options.adc_gain, None);
    }

    #[test]
    fn explicit_gain_must_be_a_valid_step() {
        let options: StepOptions = serde_json::from_str(r#"{ "measure_pmt": true, "adc_gain": 8 }"#).unwrap();
        assert_eq!(options.adc_gain, Some(AdcGain::X8));
        assert!(serde_json::from_str::<StepOptions>(r#"{ "adc_gain": 0 }"#).is_err());
        assert!(serde_json::from_str::<StepOptions>(r#"{ "adc_gain": 17 }"#).is_err());
    }

    #[test]
    fn background_label_is_case_insensitive() {
        let mut options = StepOptions::default();
        assert!(!options.is_background());
        options.label = Some(" Background ".into());
        assert!(options.is_background());
        options.label = Some("sample 1".into());
        assert!(!options.is_background());
    }

    #[test]
    fn bounds_are_enforced() {
        let mut options = StepOptions {
            pump_frequency_hz: 0.5,
            ..StepOptions::default()
        };
        assert!(options.validate_pump().is_err());
        options.pump_frequency_hz = 10.0;
        options.pump_duration_s = 0.05;
        assert!(options.validate_pump().is_err());
        options.pump_duration_s = 0.1;
        assert!(options.validate_pump().is_ok());
        options.pump_duration_s = 1e20;
        assert!(options.validate_pump().is_err());
        options.pump_duration_s = MAX_PUMP_DURATION_S;
        assert!(options.validate_pump().is_ok());
        options.pump_frequency_hz = f64::INFINITY;
        assert!(options.validate_pump().is_err());

        options.measurement_duration_s = -1.0;
        assert!(options.validate_pmt().is_err());
        options.measurement_duration_s = f64::NAN;
        assert!(options.validate_pmt().is_err());
        options.measurement_duration_s = 1e18;
        assert!(options.validate_pmt().is_err());
        options.measurement_duration_s = f64::INFINITY;
        assert!(options.validate_pmt().is_err());
        options.measurement_duration_s = 0.0;
        assert!(options.validate_pmt().is_ok());
    }
}
