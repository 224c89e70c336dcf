//! Adaptive ADC gain selection.
//!
//! Starting from the highest gain, sample the PMT with the shutter open and
//! halve the gain while the average reading sits in the top 1/32 of the ADC
//! range. Gain can only halve four times from 16, so the search performs at
//! most five trials.

use super::mean;
use crate::config::PmtSettings;
use crate::devices::{ADC_FULL_SCALE, AdcGain, Board};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Readings at or above this are considered saturated: 2^24 - 2^19.
pub const SATURATION_THRESHOLD: f64 = ((1u32 << 24) - (1u32 << 19)) as f64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainSelection {
    pub gain: AdcGain,
    /// Set only when the signal clips the ADC even at unity gain.
    pub overrange: bool,
    /// Average trial reading at the selected gain.
    pub average: f64,
}

pub struct AutoGainCalibrator {
    reads: usize,
    rate_hz: f64,
}

impl AutoGainCalibrator {
    pub fn new(settings: &PmtSettings) -> Self {
        AutoGainCalibrator {
            reads: settings.gain_trial_reads,
            rate_hz: settings.gain_trial_rate_hz,
        }
    }

    pub fn select_gain(&self, board: &mut dyn Board) -> Result<GainSelection> {
        let selection = search_gain(|gain| self.trial(board, gain))?;
        info!(
            "Selected ADC gain {} (average {:.0}, overrange {})",
            selection.gain, selection.average, selection.overrange
        );
        Ok(selection)
    }

    /// Average reading at `gain`. The shutter is closed again even if the
    /// read fails.
    fn trial(&self, board: &mut dyn Board, gain: AdcGain) -> Result<f64> {
        board.adc_set_gain(gain)?;
        board.pmt_open_shutter()?;
        let readings = board.adc_read(self.rate_hz, self.reads);
        let closed = board.pmt_close_shutter();
        let readings = readings?;
        closed?;
        mean(readings.into_iter().map(f64::from))
    }
}

/// Gain search over an arbitrary trial, returning the first unsaturated gain.
pub fn search_gain(mut trial: impl FnMut(AdcGain) -> Result<f64>) -> Result<GainSelection> {
    let mut gain = AdcGain::MAX;
    loop {
        let average = trial(gain)?;
        if average < SATURATION_THRESHOLD {
            return Ok(GainSelection {
                gain,
                overrange: false,
                average,
            });
        }
        match gain.halve() {
            Some(lower) => {
                debug!("ADC saturated at gain {} (average {:.0}), trying {}", gain, average, lower);
                gain = lower;
            }
            None => {
                let overrange = average >= ADC_FULL_SCALE as f64;
                if overrange {
                    warn!("PMT signal exceeds the ADC range even at unity gain");
                }
                return Ok(GainSelection {
                    gain,
                    overrange,
                    average,
                });
            }
        }
    }
}
