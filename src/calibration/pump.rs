//! Capacitance-feedback reservoir filling.

use super::mean;
use crate::clock::{CancelToken, Clock};
use crate::config::PumpSettings;
use crate::devices::{Board, CapacitanceSensor};
use crate::error::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FillOutcome {
    /// Average capacitance of the last cycle, in farads.
    pub capacitance: f64,
    pub reached: bool,
    pub cycles: usize,
    pub elapsed: Duration,
}

pub struct AutoPumpController {
    settings: PumpSettings,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
}

impl AutoPumpController {
    pub fn new(settings: PumpSettings, clock: Arc<dyn Clock>, cancel: CancelToken) -> Self {
        AutoPumpController { settings, clock, cancel }
    }

    /// Pump in short bursts until the reservoir capacitance reaches
    /// `max_capacitance` or the fill timeout runs out. The pump is always
    /// off when this returns.
    pub fn fill_to_target(
        &self,
        board: &mut dyn Board,
        sensor: &mut dyn CapacitanceSensor,
        max_capacitance: f64,
    ) -> Result<FillOutcome> {
        // Targets are compared at picofarad resolution.
        let target = (max_capacitance * 1e12).round() / 1e12;
        info!("Filling reservoir to {:e} F", target);

        // Setup failures still fall through to the pump shutdown below
        let start = self.clock.now();
        let filled = board
            .pump_set_frequency(self.settings.fill_frequency_hz)
            .and_then(|()| sensor.select_channel(self.settings.reservoir_channel))
            .and_then(|()| self.fill_loop(board, sensor, target, start));
        let stopped = board.pump_deactivate();

        match &filled {
            Ok(outcome) => {
                info!("Capacitance of filled reservoir: {:e}", outcome.capacitance);
                if !outcome.reached {
                    warn!(
                        "Reservoir fill timed out after {:?} below target {:e}",
                        outcome.elapsed, target
                    );
                }
            }
            Err(e) => warn!("Reservoir fill aborted: {}", e),
        }
        let outcome = filled?;
        stopped?;
        Ok(outcome)
    }

    fn fill_loop(
        &self,
        board: &mut dyn Board,
        sensor: &mut dyn CapacitanceSensor,
        target: f64,
        start: Instant,
    ) -> Result<FillOutcome> {
        let mut capacitance = 0.0;
        let mut cycles = 0;
        loop {
            let elapsed = self.clock.now().saturating_duration_since(start);
            if capacitance >= target || elapsed >= self.settings.fill_timeout() {
                return Ok(FillOutcome {
                    capacitance,
                    reached: capacitance >= target,
                    cycles,
                    elapsed,
                });
            }
            self.cancel.check()?;

            board.pump_activate()?;
            let readings: Result<Vec<f64>> = (0..self.settings.samples_per_cycle)
                .map(|_| sensor.measure_capacitance())
                .collect();
            board.pump_deactivate()?;
            capacitance = mean(readings?)?;
            cycles += 1;
        }
    }

    /// Average capacitance of a manually filled reservoir, used as the target
    /// for later fills.
    pub fn measure_baseline(&self, sensor: &mut dyn CapacitanceSensor) -> Result<f64> {
        warn!("Please load the reservoir before its baseline capacitance is measured");
        sensor.select_channel(self.settings.reservoir_channel)?;
        let readings: Result<Vec<f64>> = (0..self.settings.baseline_samples)
            .map(|_| sensor.measure_capacitance())
            .collect();
        let released = sensor.release_channels();
        let baseline = mean(readings?)?;
        released?;
        info!("Capacitance of reservoir: {:e}", baseline);
        Ok(baseline)
    }
}
