use crate::calibration::{FillOutcome, GainSelection};
use crate::devices::{AdcCalibration, AdcGain, Board, Environment, Led};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ADC self-calibration captured during a background measurement and reused
/// by later steps of the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub self_cal_gain: u32,
    pub self_cal_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// Seconds since the first sample of the series.
    pub relative_time_s: f64,
    /// Raw ADC counts.
    pub value: f64,
}

/// One PMT acquisition. Immutable once handed to a recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSeries {
    pub name: String,
    pub step_number: usize,
    pub started_at: DateTime<Utc>,
    pub sampling_rate_hz: f64,
    pub gain: AdcGain,
    pub overrange: bool,
    /// Self-calibration in effect, `None` if no background was measured.
    pub calibration: Option<CalibrationState>,
    pub sys_offset_cal: u32,
    pub sys_gain_cal: u32,
    pub samples: Vec<Sample>,
}

impl MeasurementSeries {
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: f64) {
        let origin = self.samples.first().map_or(timestamp, |first| first.timestamp);
        let relative_time_s = (timestamp - origin)
            .num_microseconds()
            .map_or(0.0, |micros| micros as f64 / 1e6);
        self.samples.push(Sample {
            timestamp,
            relative_time_s,
            value,
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(|s| s.value).sum::<f64>() / self.samples.len() as f64)
    }
}

/// Per-step record of what was applied and measured.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepLog {
    pub step_number: usize,
    pub label: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub magnet_engaged: bool,
    pub environment: Option<Environment>,
    pub fill: Option<FillOutcome>,
    pub adc_calibration: Option<AdcCalibration>,
    /// Measured PMT reference voltage in volts.
    pub pmt_reference_voltage: Option<f64>,
    pub gain: Option<GainSelection>,
    pub series_name: Option<String>,
    pub errors: Vec<String>,
}

impl StepLog {
    pub fn new(step_number: usize, label: Option<String>, magnet_engaged: bool, recorded_at: DateTime<Utc>) -> Self {
        StepLog {
            step_number,
            label,
            recorded_at,
            magnet_engaged,
            environment: None,
            fill: None,
            adc_calibration: None,
            pmt_reference_voltage: None,
            gain: None,
            series_name: None,
            errors: Vec::new(),
        }
    }
}

/// LED state saved before a measurement so it can be put back afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedSnapshot {
    on: [bool; 2],
    brightness: Option<[f64; 2]>,
}

impl LedSnapshot {
    pub fn capture(board: &mut dyn Board) -> Result<Self> {
        let on = [board.led_on(Led::One)?, board.led_on(Led::Two)?];
        let brightness = if board.capabilities().led_brightness {
            Some([board.led_brightness(Led::One)?, board.led_brightness(Led::Two)?])
        } else {
            None
        };
        Ok(LedSnapshot { on, brightness })
    }

    /// Every LED is attempted even if an earlier one fails; the first error
    /// is returned.
    pub fn restore(&self, board: &mut dyn Board) -> Result<()> {
        let mut first_error = None;
        for (i, led) in Led::ALL.into_iter().enumerate() {
            if let Some(brightness) = self.brightness {
                if let Err(e) = board.set_led_brightness(led, brightness[i]) {
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = board.set_led_on(led, self.on[i]) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Capabilities;
    use crate::devices::mock::{Call, MockBoard};
    use chrono::Duration;

    fn series() -> MeasurementSeries {
        MeasurementSeries {
            name: "PMT_readings-step0001".into(),
            step_number: 1,
            started_at: Utc::now(),
            sampling_rate_hz: 10.0,
            gain: AdcGain::X16,
            overrange: false,
            calibration: None,
            sys_offset_cal: 0,
            sys_gain_cal: 0x800000,
            samples: Vec::new(),
        }
    }

    #[test]
    fn relative_time_counts_from_first_sample() {
        let mut series = series();
        let t0 = Utc::now();
        series.push(t0, 10.0);
        series.push(t0 + Duration::milliseconds(100), 20.0);
        series.push(t0 + Duration::milliseconds(1_500), 30.0);

        let times: Vec<f64> = series.samples.iter().map(|s| s.relative_time_s).collect();
        assert_eq!(times, vec![0.0, 0.1, 1.5]);
        assert_eq!(series.mean(), Some(20.0));
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn empty_series_has_no_mean() {
        assert_eq!(series().mean(), None);
        assert!(series().is_empty());
    }

    #[test]
    fn snapshot_restores_state() {
        let board = MockBoard::new();
        board.set_leds([true, false], [0.3, 0.6]);
        let mut handle = board.clone();

        let snapshot = LedSnapshot::capture(&mut handle).unwrap();
        board.set_leds([false, true], [0.0, 1.0]);
        snapshot.restore(&mut handle).unwrap();

        assert_eq!(board.leds(), ([true, false], [0.3, 0.6]));
    }

    #[test]
    fn snapshot_without_brightness_control() {
        let board = MockBoard::new();
        board.set_capabilities(Capabilities {
            led_brightness: false,
            ..Capabilities::default()
        });
        let mut handle = board.clone();

        let snapshot = LedSnapshot::capture(&mut handle).unwrap();
        snapshot.restore(&mut handle).unwrap();

        assert_eq!(
            board.calls(),
            vec![Call::SetLedOn(Led::One, true), Call::SetLedOn(Led::Two, true)]
        );
    }

    #[test]
    fn restore_continues_past_a_failure() {
        let board = MockBoard::new();
        let mut handle = board.clone();
        let snapshot = LedSnapshot::capture(&mut handle).unwrap();
        board.fail_on("set_led_brightness");

        assert!(snapshot.restore(&mut handle).is_err());
        assert_eq!(
            board.calls(),
            vec![Call::SetLedOn(Led::One, true), Call::SetLedOn(Led::Two, true)]
        );
    }
}
