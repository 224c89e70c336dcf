//! Closed-loop routines run on the board ahead of a measurement.

pub mod gain;
pub mod pump;

pub use gain::{AutoGainCalibrator, GainSelection};
pub use pump::{AutoPumpController, FillOutcome};

use crate::error::{BoardError, Result};

pub(crate) fn mean<I>(values: I) -> Result<f64>
where
    I: IntoIterator<Item = f64>,
{
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        return Err(BoardError::Parse("cannot average an empty set of readings".into()));
    }
    Ok(sum / count as f64)
}
