//! Per-step orchestration of the magnet, pump and PMT subsystems.
//!
//! Each call to [`StepOrchestrator::apply`] runs the three branches in order.
//! A failing branch is logged and reported but never stops the others, and
//! the LED state is always put back after a PMT measurement.

pub mod data;
pub mod options;
pub mod record;

pub use data::{CalibrationState, LedSnapshot, MeasurementSeries, Sample, StepLog};
pub use options::StepOptions;
pub use record::{MemoryRecorder, NdjsonRecorder, Recorder};

use crate::board_state::BoardStateController;
use crate::calibration::{AutoGainCalibrator, AutoPumpController, FillOutcome, mean};
use crate::clock::{CancelToken, Clock};
use crate::config::{BoardConfig, LedSettings, PmtSettings, PumpSettings, Settings};
use crate::connection::ConnectionManager;
use crate::devices::{AdcGain, Board, CapacitanceSensor, Led, pmt_digipot_steps};
use crate::error::{BoardError, Result};
use crate::prompt::UserPrompt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Intermediate z-stage position used before homing so the stage never hits
/// the end stop at full speed.
pub const ZSTAGE_LOW_POSITION: f64 = 1.0;

/// Positions closer than this are treated as equal.
const POSITION_TOLERANCE: f64 = 1e-3;

/// PMT samples are read in chunks of this length.
const SAMPLE_CHUNK: Duration = Duration::from_secs(1);

/// Upper bound on the samples of one PMT series.
pub const MAX_SERIES_SAMPLES: usize = 10_000_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BranchOutcome {
    Skipped,
    Completed,
    Failed(String),
}

impl BranchOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, BranchOutcome::Failed(_))
    }
}

/// What happened during one `apply` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub connected: bool,
    pub magnet: BranchOutcome,
    pub pump: BranchOutcome,
    pub pmt: BranchOutcome,
    pub series_name: Option<String>,
}

impl StepReport {
    fn skipped(connected: bool) -> Self {
        StepReport {
            connected,
            magnet: BranchOutcome::Skipped,
            pump: BranchOutcome::Skipped,
            pmt: BranchOutcome::Skipped,
            series_name: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.connected && ![&self.magnet, &self.pump, &self.pmt].iter().any(|b| b.is_failed())
    }

    fn errors(&self) -> Vec<String> {
        [&self.magnet, &self.pump, &self.pmt]
            .into_iter()
            .filter_map(|outcome| match outcome {
                BranchOutcome::Failed(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }
}

pub struct StepOrchestrator<R: Recorder> {
    connection: ConnectionManager,
    board_state: BoardStateController,
    gain: AutoGainCalibrator,
    pump: AutoPumpController,
    recorder: R,
    clock: Arc<dyn Clock>,
    settings: Settings,
    sensor: Option<Box<dyn CapacitanceSensor>>,
    calibration: Option<CalibrationState>,
    /// Connection session the stored calibration belongs to.
    calibration_session: u64,
    max_capacitance: Option<f64>,
}

impl<R: Recorder> StepOrchestrator<R> {
    pub fn new(
        connection: ConnectionManager,
        recorder: R,
        settings: Settings,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> Self {
        StepOrchestrator {
            board_state: BoardStateController::new(settings.leds.clone()),
            gain: AutoGainCalibrator::new(&settings.pmt),
            pump: AutoPumpController::new(settings.pump.clone(), clock.clone(), cancel),
            connection,
            recorder,
            clock,
            settings,
            sensor: None,
            calibration: None,
            calibration_session: 0,
            max_capacitance: None,
        }
    }

    /// Attach the capacitance sensor used for feedback pumping.
    pub fn with_capacitance_sensor(mut self, sensor: Box<dyn CapacitanceSensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn connection(&mut self) -> &mut ConnectionManager {
        &mut self.connection
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    /// Calibration captured in the current session, if any.
    pub fn calibration(&self) -> Option<CalibrationState> {
        self.calibration
            .filter(|_| self.calibration_session == self.connection.session())
    }

    pub fn max_capacitance(&self) -> Option<f64> {
        self.max_capacitance
    }

    /// Open a fresh session and reset the board. Any stored calibration
    /// belongs to the previous session and is dropped.
    pub fn connect(&mut self) -> bool {
        self.calibration = None;
        if !self.connection.open() {
            return false;
        }
        self.reset();
        true
    }

    pub fn disconnect(&mut self) {
        self.calibration = None;
        self.connection.close();
    }

    /// Drop a calibration captured before the connection was last reopened.
    fn track_session(&mut self) {
        let session = self.connection.session();
        if session == self.calibration_session {
            return;
        }
        if self.calibration.take().is_some() {
            info!("Board was reconnected, discarding ADC self calibration");
        }
        self.calibration_session = session;
    }

    pub fn reset(&mut self) {
        if let Err(e) = self.board_state.reset(&mut self.connection) {
            error!("Error resetting board state: {}", e);
        }
    }

    /// Reset the board and, for feedback pumping, measure the filled
    /// reservoir to get the fill target.
    pub fn begin_experiment(&mut self) {
        self.reset();
        if !self.settings.pump.use_auto_pump {
            return;
        }
        let Some(sensor) = self.sensor.as_deref_mut() else {
            warn!("Auto pump is enabled but no capacitance sensor is attached");
            return;
        };
        match self.pump.measure_baseline(sensor) {
            Ok(baseline) => self.max_capacitance = Some(baseline),
            Err(e) => error!("Error measuring reservoir capacitance: {}", e),
        }
    }

    /// Close the PMT shutter while the protocol is paused.
    pub fn pause(&mut self) {
        let Some(board) = self.connection.board_mut() else {
            return;
        };
        if let Err(e) = board.pmt_close_shutter() {
            error!("Error closing PMT shutter: {}", e);
        }
    }

    /// Hand the recorder its chance to export. Returns whether the export
    /// went through.
    pub fn finish_protocol(&mut self, prompt: &mut dyn UserPrompt) -> bool {
        match self.recorder.finish(prompt) {
            Ok(()) => true,
            Err(e) => {
                error!("Error finishing protocol: {}", e);
                false
            }
        }
    }

    pub fn set_led_settings(&mut self, leds: LedSettings) {
        self.settings.leds = leds.clone();
        self.board_state.set_led_settings(leds);
        self.update_leds();
    }

    pub fn update_leds(&mut self) {
        let Some(board) = self.connection.board_mut() else {
            return;
        };
        if let Err(e) = self.board_state.update_leds(board) {
            error!("Error updating LED brightness: {}", e);
        }
    }

    /// Apply one protocol step. Never fails; what happened is in the report.
    pub fn apply(&mut self, step_number: usize, options: &StepOptions) -> StepReport {
        self.track_session();
        let Some(board) = self.connection.board_mut() else {
            self.connection.warn_not_connected();
            return StepReport::skipped(false);
        };
        debug!("Applying step {}: {:?}", step_number, options);

        let mut report = StepReport::skipped(true);
        let mut log = StepLog::new(
            step_number,
            options.label.clone(),
            options.magnet_engaged,
            self.clock.wall_now(),
        );

        // Ambient conditions are informational only
        if let Some(sensor) = self.sensor.as_deref_mut() {
            match sensor.environment() {
                Ok(Some(environment)) => {
                    info!(
                        "temp={:.1}C, Rel. humidity={:.1}%",
                        environment.temperature_celsius,
                        environment.relative_humidity * 100.0
                    );
                    log.environment = Some(environment);
                }
                Ok(None) => {}
                Err(e) => debug!("Failed to get environment data: {}", e),
            }
        }

        let config = match board.config() {
            Ok(config) => config,
            Err(e) => {
                error!("Error reading board configuration: {}", e);
                let failed = BranchOutcome::Failed(e.to_string());
                report.magnet = failed.clone();
                if options.pump_enabled {
                    report.pump = failed.clone();
                }
                if options.measure_pmt {
                    report.pmt = failed;
                }
                self.finish_step(log, &report);
                return report;
            }
        };

        report.magnet = outcome("magnet", apply_magnet(board, &config, options.magnet_engaged));

        if options.pump_enabled {
            let pumped = apply_pump(
                board,
                &mut self.sensor,
                &self.pump,
                &self.settings.pump,
                self.max_capacitance,
                &*self.clock,
                options,
            );
            if let Ok(Some(fill)) = &pumped {
                log.fill = Some(*fill);
            }
            report.pump = outcome("pump", pumped.map(|_| ()));
        }

        if options.measure_pmt {
            let mut run = PmtRun {
                config: &config,
                pmt: &self.settings.pmt,
                calibrator: &self.gain,
                calibration: &mut self.calibration,
                clock: &*self.clock,
                log: &mut log,
            };
            let measured = run.measure_isolated(board, step_number, options).and_then(|series| {
                let name = series.name.clone();
                self.recorder.record(series)?;
                Ok(name)
            });
            match measured {
                Ok(name) => {
                    log.series_name = Some(name.clone());
                    report.series_name = Some(name);
                    report.pmt = BranchOutcome::Completed;
                }
                Err(e) => report.pmt = outcome("PMT", Err(e)),
            }
        }

        self.finish_step(log, &report);
        report
    }

    fn finish_step(&mut self, mut log: StepLog, report: &StepReport) {
        log.errors = report.errors();
        if let Err(e) = self.recorder.log_step(&log) {
            warn!("Could not record step log: {}", e);
        }
    }
}

fn outcome(branch: &str, result: Result<()>) -> BranchOutcome {
    match result {
        Ok(()) => BranchOutcome::Completed,
        Err(e) => {
            error!("Error applying {} step options: {}", branch, e);
            BranchOutcome::Failed(e.to_string())
        }
    }
}

fn apply_magnet(board: &mut dyn Board, config: &BoardConfig, engaged: bool) -> Result<()> {
    if engaged {
        let position = board.zstage_position()?;
        if (position - config.zstage_up_position).abs() > POSITION_TOLERANCE {
            info!("Engaging magnet: moving z-stage to {}", config.zstage_up_position);
            board.zstage_move_to(config.zstage_up_position)?;
        } else {
            debug!("Magnet already engaged");
        }
    } else if !board.zstage_is_down()? {
        info!("Disengaging magnet: homing z-stage via {}", ZSTAGE_LOW_POSITION);
        board.zstage_move_to(ZSTAGE_LOW_POSITION)?;
        board.zstage_home()?;
    } else {
        debug!("Magnet already disengaged");
    }
    Ok(())
}

/// Returns the fill outcome when feedback pumping ran.
fn apply_pump(
    board: &mut dyn Board,
    sensor: &mut Option<Box<dyn CapacitanceSensor>>,
    pump: &AutoPumpController,
    settings: &PumpSettings,
    max_capacitance: Option<f64>,
    clock: &dyn Clock,
    options: &StepOptions,
) -> Result<Option<FillOutcome>> {
    options.validate_pump()?;

    if settings.use_auto_pump {
        match (sensor.as_deref_mut(), max_capacitance) {
            (Some(sensor), Some(target)) => return pump.fill_to_target(board, sensor, target).map(Some),
            _ => warn!("Auto pump has no capacitance sensor or reservoir baseline, pumping for the step duration"),
        }
    }

    info!(
        "Pumping at {} Hz for {} s",
        options.pump_frequency_hz, options.pump_duration_s
    );
    let hold = Duration::try_from_secs_f64(options.pump_duration_s)
        .map_err(|e| BoardError::InvalidOption(format!("pump duration {}: {}", options.pump_duration_s, e)))?;
    board.pump_set_frequency(options.pump_frequency_hz)?;
    board.pump_activate()?;
    clock.sleep(hold);
    board.pump_deactivate()?;
    Ok(None)
}

/// Borrowed state needed by one PMT measurement.
struct PmtRun<'a> {
    config: &'a BoardConfig,
    pmt: &'a PmtSettings,
    calibrator: &'a AutoGainCalibrator,
    calibration: &'a mut Option<CalibrationState>,
    clock: &'a dyn Clock,
    log: &'a mut StepLog,
}

impl PmtRun<'_> {
    /// Measure with the LEDs off, putting them back however the measurement
    /// ends.
    fn measure_isolated(
        &mut self,
        board: &mut dyn Board,
        step_number: usize,
        options: &StepOptions,
    ) -> Result<MeasurementSeries> {
        options.validate_pmt()?;
        let snapshot = LedSnapshot::capture(board)?;

        let measured = self.measure(board, step_number, options);

        if let Err(e) = snapshot.restore(board) {
            error!("Error restoring LED state: {}", e);
            if measured.is_ok() {
                return Err(e);
            }
        }
        measured
    }

    fn measure(&mut self, board: &mut dyn Board, step_number: usize, options: &StepOptions) -> Result<MeasurementSeries> {
        // Stray light from the LEDs would swamp the PMT
        for led in Led::ALL {
            board.set_led_on(led, false)?;
        }

        // ADC setup: digipot, self calibration, then system calibration
        board.adc_begin()?;
        board.pmt_set_pot(pmt_digipot_steps(self.config.pmt_control_voltage))?;
        self.apply_self_calibration(board, options.is_background())?;
        board.adc_set_sys_offset_cal(self.config.pmt_sys_offset_cal)?;
        board.adc_set_sys_gain_cal(self.config.pmt_sys_gain_cal)?;

        // Read back what the ADC actually holds
        let registers = board.adc_calibration()?;
        info!("ADC calibration: {:?}", registers);
        self.log.adc_calibration = Some(registers);
        self.log.pmt_reference_voltage = self.check_reference_voltage(board)?;

        let (gain, overrange) = match options.adc_gain {
            Some(gain) => {
                info!("Using ADC gain {}", gain);
                (gain, false)
            }
            None => {
                let selection = self.calibrator.select_gain(board)?;
                self.log.gain = Some(selection);
                (selection.gain, selection.overrange)
            }
        };
        board.adc_set_gain(gain)?;

        let name = options
            .label
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map_or_else(|| record::default_series_name(step_number), str::to_string);
        self.sample(board, name, step_number, gain, overrange, options.measurement_duration_s)
    }

    /// Capture the self-calibration on a background step, otherwise reuse the
    /// stored one.
    fn apply_self_calibration(&mut self, board: &mut dyn Board, background: bool) -> Result<()> {
        if background {
            let state = CalibrationState {
                self_cal_gain: board.adc_self_cal_gain()?,
                self_cal_offset: board.adc_self_cal_offset()?,
            };
            info!("Captured ADC self calibration: {:?}", state);
            *self.calibration = Some(state);
        } else if let Some(state) = *self.calibration {
            board.adc_set_self_cal_gain(state.self_cal_gain)?;
            board.adc_set_self_cal_offset(state.self_cal_offset)?;
        } else {
            warn!("Missing ADC calibration values! Please perform a background measurement.");
        }
        Ok(())
    }

    fn check_reference_voltage(&self, board: &mut dyn Board) -> Result<Option<f64>> {
        if !board.capabilities().pmt_reference_voltage {
            return Ok(None);
        }
        let reads: Result<Vec<f64>> = (0..self.pmt.reference_voltage_reads)
            .map(|_| board.pmt_reference_voltage())
            .collect();
        let volts = mean(reads?)?;
        let minimum = (self.config.pmt_control_voltage - 100.0) / 1000.0;
        if volts < minimum {
            warn!(
                "PMT control voltage error: reference reads {:.3} V, expected at least {:.3} V",
                volts, minimum
            );
        }
        Ok(Some(volts))
    }

    /// Read for the requested duration plus the guard time with the shutter
    /// open. The shutter is closed again even if a read fails.
    fn sample(
        &self,
        board: &mut dyn Board,
        name: String,
        step_number: usize,
        gain: AdcGain,
        overrange: bool,
        duration_s: f64,
    ) -> Result<MeasurementSeries> {
        let rate = self.config.pmt_sampling_rate;
        if !(rate > 0.0) || !rate.is_finite() {
            return Err(BoardError::InvalidOption(format!("PMT sampling rate must be positive, got {}", rate)));
        }
        let window = duration_s + self.pmt.guard_time().as_secs_f64();
        let total = (window * rate).ceil();
        if !(total <= MAX_SERIES_SAMPLES as f64) {
            return Err(BoardError::InvalidOption(format!(
                "{:.1} s at {} Hz exceeds {} samples",
                window, rate, MAX_SERIES_SAMPLES
            )));
        }
        let total = total as usize;
        let per_chunk = ((SAMPLE_CHUNK.as_secs_f64() * rate).round() as usize).max(1);

        let started_at = self.clock.wall_now();
        let mut series = MeasurementSeries {
            name,
            step_number,
            started_at,
            sampling_rate_hz: rate,
            gain,
            overrange,
            calibration: *self.calibration,
            sys_offset_cal: self.config.pmt_sys_offset_cal,
            sys_gain_cal: self.config.pmt_sys_gain_cal,
            samples: Vec::new(),
        };
        info!("Measuring PMT for {:.1} s at {} Hz ({} samples)", window, rate, total);

        // Shutter open only while reading
        board.pmt_open_shutter()?;
        let read = read_chunks(board, rate, total, per_chunk);
        let closed = board.pmt_close_shutter();
        let readings = read?;
        closed?;

        for (index, value) in readings.into_iter().enumerate() {
            let offset = chrono::Duration::microseconds((index as f64 / rate * 1e6).round() as i64);
            series.push(started_at + offset, f64::from(value));
        }
        Ok(series)
    }
}

fn read_chunks(board: &mut dyn Board, rate: f64, total: usize, per_chunk: usize) -> Result<Vec<u32>> {
    let mut readings = Vec::new();
    while readings.len() < total {
        let count = per_chunk.min(total - readings.len());
        let chunk = board.adc_read(rate, count)?;
        if chunk.is_empty() {
            return Err(BoardError::Timeout("PMT samples".into()));
        }
        readings.extend(chunk);
    }
    Ok(readings)
}
