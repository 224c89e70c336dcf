//! In-memory stand-ins for the board and the capacitance sensor.
//!
//! Clones share state, so a test can hand one clone to the code under test and
//! keep another to inspect the command journal afterwards.

use super::{
    Adc, AdcCalibration, AdcGain, Board, BoardConnector, Capabilities, CapacitanceSensor, Environment, Led, Leds,
    PinMode, PmtShutter, Pump, ZStage,
};
use crate::config::BoardConfig;
use crate::error::{BoardError, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Commands that change board state, in the order they were issued.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ZStageHome,
    ZStageMoveTo(f64),
    PumpActivate,
    PumpDeactivate,
    PumpSetFrequency(f64),
    PinMode(u8, PinMode),
    OpenShutter,
    CloseShutter,
    SetPot(u8),
    AdcBegin,
    AdcSetSelfCalGain(u32),
    AdcSetSelfCalOffset(u32),
    AdcSetSysOffsetCal(u32),
    AdcSetSysGainCal(u32),
    AdcSetGain(AdcGain),
    AdcRead { rate_hz: f64, count: usize },
    SetLedOn(Led, bool),
    SetLedBrightness(Led, f64),
    Close,
}

type AdcResponse = Box<dyn FnMut(AdcGain) -> u32 + Send>;

struct MockState {
    calls: Vec<Call>,
    faults: HashSet<&'static str>,
    closed: bool,
    config: BoardConfig,
    capabilities: Capabilities,
    host_version: String,
    remote_version: String,
    zstage_position: f64,
    homing_verifies: bool,
    pump_active: bool,
    shutter_open: bool,
    led_on: [bool; 2],
    led_brightness: [f64; 2],
    reference_voltage: f64,
    begin_count: u32,
    calibration: AdcCalibration,
    gain: AdcGain,
    adc_response: AdcResponse,
}

#[derive(Clone)]
pub struct MockBoard {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBoard {
    pub fn new() -> Self {
        let state = MockState {
            calls: Vec::new(),
            faults: HashSet::new(),
            closed: false,
            config: BoardConfig::default(),
            capabilities: Capabilities::default(),
            host_version: "1.2.0".to_string(),
            remote_version: "1.2.0".to_string(),
            zstage_position: 0.0,
            homing_verifies: true,
            pump_active: false,
            shutter_open: false,
            led_on: [true, true],
            led_brightness: [0.5, 0.5],
            reference_voltage: 0.8,
            begin_count: 0,
            calibration: AdcCalibration::default(),
            gain: AdcGain::X1,
            adc_response: Box::new(|_| 1_000),
        };
        MockBoard {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Journal a command, failing if a fault was injected for `op`.
    fn issue(&self, op: &'static str, call: Option<Call>) -> Result<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        if state.closed {
            return Err(BoardError::NotConnected);
        }
        if state.faults.contains(op) {
            return Err(BoardError::Protocol {
                command: op.to_string(),
                reply: "injected fault".to_string(),
            });
        }
        if let Some(call) = call {
            state.calls.push(call);
        }
        Ok(state)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make every call to the named operation fail, e.g. `"adc_read"`.
    pub fn fail_on(&self, op: &'static str) {
        self.lock().faults.insert(op);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn set_config(&self, config: BoardConfig) {
        self.lock().config = config;
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.lock().capabilities = capabilities;
    }

    pub fn set_versions(&self, host: &str, remote: &str) {
        let mut state = self.lock();
        state.host_version = host.to_string();
        state.remote_version = remote.to_string();
    }

    pub fn set_zstage_position(&self, position: f64) {
        self.lock().zstage_position = position;
    }

    pub fn zstage_position_now(&self) -> f64 {
        self.lock().zstage_position
    }

    /// When false the home switch never reports the stage as down.
    pub fn set_homing_verifies(&self, verifies: bool) {
        self.lock().homing_verifies = verifies;
    }

    pub fn set_reference_voltage(&self, volts: f64) {
        self.lock().reference_voltage = volts;
    }

    /// Reading returned for every conversion at the given gain.
    pub fn set_adc_response(&self, response: impl FnMut(AdcGain) -> u32 + Send + 'static) {
        self.lock().adc_response = Box::new(response);
    }

    pub fn set_leds(&self, on: [bool; 2], brightness: [f64; 2]) {
        let mut state = self.lock();
        state.led_on = on;
        state.led_brightness = brightness;
    }

    pub fn leds(&self) -> ([bool; 2], [f64; 2]) {
        let state = self.lock();
        (state.led_on, state.led_brightness)
    }

    pub fn pump_active(&self) -> bool {
        self.lock().pump_active
    }

    pub fn shutter_open(&self) -> bool {
        self.lock().shutter_open
    }

    pub fn calibration_registers(&self) -> AdcCalibration {
        self.lock().calibration
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Self-calibration results differ on every `adc_begin` so tests can tell a
/// fresh calibration from a restored one.
fn fresh_self_calibration(begin_count: u32) -> (u32, u32) {
    (0x80_0000 + begin_count, 0x100 + begin_count)
}

impl ZStage for MockBoard {
    fn zstage_home(&mut self) -> Result<()> {
        let mut state = self.issue("zstage_home", Some(Call::ZStageHome))?;
        state.zstage_position = state.config.zstage_down_position;
        Ok(())
    }

    fn zstage_move_to(&mut self, position: f64) -> Result<()> {
        let mut state = self.issue("zstage_move_to", Some(Call::ZStageMoveTo(position)))?;
        state.zstage_position = position;
        Ok(())
    }

    fn zstage_position(&mut self) -> Result<f64> {
        Ok(self.issue("zstage_position", None)?.zstage_position)
    }

    fn zstage_is_down(&mut self) -> Result<bool> {
        let state = self.issue("zstage_is_down", None)?;
        Ok(state.homing_verifies && state.zstage_position <= state.config.zstage_down_position)
    }
}

impl Pump for MockBoard {
    fn pump_activate(&mut self) -> Result<()> {
        self.issue("pump_activate", Some(Call::PumpActivate))?.pump_active = true;
        Ok(())
    }

    fn pump_deactivate(&mut self) -> Result<()> {
        self.issue("pump_deactivate", Some(Call::PumpDeactivate))?.pump_active = false;
        Ok(())
    }

    fn pump_set_frequency(&mut self, frequency_hz: f64) -> Result<()> {
        drop(self.issue("pump_set_frequency", Some(Call::PumpSetFrequency(frequency_hz)))?);
        Ok(())
    }
}

impl PmtShutter for MockBoard {
    fn pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<()> {
        drop(self.issue("pin_mode", Some(Call::PinMode(pin, mode)))?);
        Ok(())
    }

    fn pmt_open_shutter(&mut self) -> Result<()> {
        self.issue("pmt_open_shutter", Some(Call::OpenShutter))?.shutter_open = true;
        Ok(())
    }

    fn pmt_close_shutter(&mut self) -> Result<()> {
        self.issue("pmt_close_shutter", Some(Call::CloseShutter))?.shutter_open = false;
        Ok(())
    }

    fn pmt_set_pot(&mut self, steps: u8) -> Result<()> {
        drop(self.issue("pmt_set_pot", Some(Call::SetPot(steps)))?);
        Ok(())
    }

    fn pmt_reference_voltage(&mut self) -> Result<f64> {
        let state = self.issue("pmt_reference_voltage", None)?;
        if !state.capabilities.pmt_reference_voltage {
            return Err(BoardError::Unsupported("PMT reference voltage readback"));
        }
        Ok(state.reference_voltage)
    }
}

impl Adc for MockBoard {
    fn adc_begin(&mut self) -> Result<()> {
        let mut state = self.issue("adc_begin", Some(Call::AdcBegin))?;
        state.begin_count += 1;
        let (gain, offset) = fresh_self_calibration(state.begin_count);
        state.calibration.self_cal_gain = gain;
        state.calibration.self_cal_offset = offset;
        Ok(())
    }

    fn adc_self_cal_gain(&mut self) -> Result<u32> {
        Ok(self.issue("adc_self_cal_gain", None)?.calibration.self_cal_gain)
    }

    fn adc_set_self_cal_gain(&mut self, value: u32) -> Result<()> {
        self.issue("adc_set_self_cal_gain", Some(Call::AdcSetSelfCalGain(value)))?
            .calibration
            .self_cal_gain = value;
        Ok(())
    }

    fn adc_self_cal_offset(&mut self) -> Result<u32> {
        Ok(self.issue("adc_self_cal_offset", None)?.calibration.self_cal_offset)
    }

    fn adc_set_self_cal_offset(&mut self, value: u32) -> Result<()> {
        self.issue("adc_set_self_cal_offset", Some(Call::AdcSetSelfCalOffset(value)))?
            .calibration
            .self_cal_offset = value;
        Ok(())
    }

    fn adc_set_sys_offset_cal(&mut self, value: u32) -> Result<()> {
        self.issue("adc_set_sys_offset_cal", Some(Call::AdcSetSysOffsetCal(value)))?
            .calibration
            .sys_offset_cal = value;
        Ok(())
    }

    fn adc_set_sys_gain_cal(&mut self, value: u32) -> Result<()> {
        self.issue("adc_set_sys_gain_cal", Some(Call::AdcSetSysGainCal(value)))?
            .calibration
            .sys_gain_cal = value;
        Ok(())
    }

    fn adc_set_gain(&mut self, gain: AdcGain) -> Result<()> {
        self.issue("adc_set_gain", Some(Call::AdcSetGain(gain)))?.gain = gain;
        Ok(())
    }

    fn adc_calibration(&mut self) -> Result<AdcCalibration> {
        Ok(self.issue("adc_calibration", None)?.calibration)
    }

    fn adc_read(&mut self, rate_hz: f64, count: usize) -> Result<Vec<u32>> {
        let mut state = self.issue("adc_read", Some(Call::AdcRead { rate_hz, count }))?;
        let gain = state.gain;
        Ok((0..count).map(|_| (state.adc_response)(gain)).collect())
    }
}

impl Leds for MockBoard {
    fn led_on(&mut self, led: Led) -> Result<bool> {
        Ok(self.issue("led_on", None)?.led_on[led.index() as usize - 1])
    }

    fn set_led_on(&mut self, led: Led, on: bool) -> Result<()> {
        self.issue("set_led_on", Some(Call::SetLedOn(led, on)))?.led_on[led.index() as usize - 1] = on;
        Ok(())
    }

    fn led_brightness(&mut self, led: Led) -> Result<f64> {
        let state = self.issue("led_brightness", None)?;
        if !state.capabilities.led_brightness {
            return Err(BoardError::Unsupported("LED brightness"));
        }
        Ok(state.led_brightness[led.index() as usize - 1])
    }

    fn set_led_brightness(&mut self, led: Led, brightness: f64) -> Result<()> {
        let mut state = self.issue("set_led_brightness", Some(Call::SetLedBrightness(led, brightness)))?;
        if !state.capabilities.led_brightness {
            return Err(BoardError::Unsupported("LED brightness"));
        }
        state.led_brightness[led.index() as usize - 1] = brightness;
        Ok(())
    }
}

impl Board for MockBoard {
    fn port(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> Capabilities {
        self.lock().capabilities
    }

    fn config(&mut self) -> Result<BoardConfig> {
        Ok(self.issue("config", None)?.config.clone())
    }

    fn properties(&mut self) -> Result<BTreeMap<String, String>> {
        drop(self.issue("properties", None)?);
        Ok(BTreeMap::from([("package_name".to_string(), "mr-box-peripheral-board".to_string())]))
    }

    fn host_software_version(&self) -> String {
        self.lock().host_version.clone()
    }

    fn remote_software_version(&mut self) -> Result<String> {
        Ok(self.issue("remote_software_version", None)?.remote_version.clone())
    }

    /// The session is closed even when a fault is injected for `close`.
    fn close(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::Close);
        state.closed = true;
        if state.faults.contains("close") {
            return Err(BoardError::Protocol {
                command: "close".to_string(),
                reply: "injected fault".to_string(),
            });
        }
        Ok(())
    }
}

struct ConnectorState {
    pending_failures: u32,
    connects: u32,
}

/// Hands out the same [`MockBoard`] on every successful connect, reopening it.
#[derive(Clone)]
pub struct MockConnector {
    board: MockBoard,
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new(board: MockBoard) -> Self {
        MockConnector {
            board,
            state: Arc::new(Mutex::new(ConnectorState {
                pending_failures: 0,
                connects: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` connects fail with a link error.
    pub fn fail_next(&self, count: u32) {
        self.lock().pending_failures = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connects
    }
}

impl BoardConnector for MockConnector {
    fn connect(&mut self) -> Result<Box<dyn Board>> {
        let mut state = self.lock();
        state.connects += 1;
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(BoardError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such serial port",
            )));
        }
        self.board.lock().closed = false;
        Ok(Box::new(self.board.clone()))
    }
}

type CapacitanceResponse = Box<dyn FnMut(usize) -> f64 + Send>;

struct SensorState {
    failing: bool,
    selected: Option<usize>,
    samples: usize,
    delay: Duration,
    response: CapacitanceResponse,
    environment: Option<Environment>,
    environment_failing: bool,
}

/// Capacitance source driven by a function of the running sample index.
#[derive(Clone)]
pub struct MockCapacitanceSensor {
    state: Arc<Mutex<SensorState>>,
}

impl MockCapacitanceSensor {
    pub fn new(response: impl FnMut(usize) -> f64 + Send + 'static) -> Self {
        MockCapacitanceSensor {
            state: Arc::new(Mutex::new(SensorState {
                failing: false,
                selected: None,
                samples: 0,
                delay: Duration::ZERO,
                response: Box::new(response),
                environment: None,
                environment_failing: false,
            })),
        }
    }

    pub fn constant(value: f64) -> Self {
        Self::new(move |_| value)
    }

    fn lock(&self) -> MutexGuard<'_, SensorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Real time spent on every measurement.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = delay;
        self
    }

    /// Every following measurement fails with a link error.
    pub fn fail_measurements(&self) {
        self.lock().failing = true;
    }

    pub fn set_environment(&self, environment: Option<Environment>) {
        self.lock().environment = environment;
    }

    /// Every following environment read fails.
    pub fn fail_environment(&self) {
        self.lock().environment_failing = true;
    }

    pub fn selected_channel(&self) -> Option<usize> {
        self.lock().selected
    }

    pub fn samples_taken(&self) -> usize {
        self.lock().samples
    }
}

impl CapacitanceSensor for MockCapacitanceSensor {
    fn select_channel(&mut self, channel: usize) -> Result<()> {
        self.lock().selected = Some(channel);
        Ok(())
    }

    fn release_channels(&mut self) -> Result<()> {
        self.lock().selected = None;
        Ok(())
    }

    fn measure_capacitance(&mut self) -> Result<f64> {
        let (delay, value) = {
            let mut state = self.lock();
            if state.failing {
                return Err(BoardError::Timeout("capacitance measurement".into()));
            }
            let index = state.samples;
            state.samples += 1;
            (state.delay, (state.response)(index))
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(value)
    }

    fn environment(&mut self) -> Result<Option<Environment>> {
        let state = self.lock();
        if state.environment_failing {
            return Err(BoardError::Timeout("environment read".into()));
        }
        Ok(state.environment)
    }
}
