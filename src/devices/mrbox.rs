//! Serial driver for the MR-Box peripheral board.
//!
//! The firmware speaks a newline-terminated text protocol. Every command gets
//! exactly one reply line: `OK`, `OK <payload>` or `ERR <message>`.

use super::{
    Adc, AdcCalibration, AdcGain, Board, BoardConnector, Capabilities, Led, Leds, PinMode, PmtShutter, Pump, ZStage,
};
use crate::config::{BoardConfig, SerialSettings};
use crate::error::{BoardError, Result};
use serialport::SerialPort;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Homing and long moves reply only once the stage has stopped.
const MOTION_TIMEOUT: Duration = Duration::from_secs(30);
const ADC_BEGIN_TIMEOUT: Duration = Duration::from_secs(5);
const READ_SLACK: Duration = Duration::from_secs(2);

pub struct MrBox {
    port: Option<BufReader<Box<dyn SerialPort>>>,
    port_name: String,
    read_timeout: Duration,
    capabilities: Capabilities,
}

impl MrBox {
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        info!("Attempting to connect to MR-Box on {} at {} baud", settings.port, settings.baud_rate);
        let port = serialport::new(&settings.port, settings.baud_rate)
            .timeout(settings.read_timeout())
            .open()?;
        let mut board = MrBox {
            port: Some(BufReader::new(port)),
            port_name: settings.port.clone(),
            read_timeout: settings.read_timeout(),
            capabilities: Capabilities::default(),
        };
        // Older firmware lacks some commands, ask once up front
        board.capabilities = board.query_capabilities()?;
        Ok(board)
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, command: &str) -> Result<()> {
        let Some(port) = &mut self.port else {
            error!("Attempted to write to MR-Box but the port is closed");
            return Err(BoardError::NotConnected);
        };
        debug!("Sending command to MR-Box: {}", command);
        let stream = port.get_mut();
        stream.write_all(format!("{}\n", command).as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    fn read_line(&mut self, command: &str) -> Result<String> {
        let Some(port) = &mut self.port else {
            error!("Attempted to read from MR-Box but the port is closed");
            return Err(BoardError::NotConnected);
        };
        let mut response = String::new();
        match port.read_line(&mut response) {
            Ok(0) => Err(BoardError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "serial port closed by remote",
            ))),
            Ok(_) => {
                let trimmed = response.trim().to_string();
                debug!("Received response from MR-Box: {}", trimmed);
                Ok(trimmed)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(BoardError::Timeout(format!("reply to `{}`", command)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn query(&mut self, command: &str) -> Result<String> {
        self.write(command)?;
        let line = self.read_line(command)?;
        parse_reply(command, &line)
    }

    /// Query with a longer read timeout for commands that block on the board.
    fn query_slow(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.set_timeout(timeout)?;
        let reply = self.query(command);
        // Put the normal timeout back even if the query failed
        let restored = self.set_timeout(self.read_timeout);
        let reply = reply?;
        restored?;
        Ok(reply)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        match &mut self.port {
            Some(port) => Ok(port.get_mut().set_timeout(timeout)?),
            None => Err(BoardError::NotConnected),
        }
    }

    fn command(&mut self, command: &str) -> Result<()> {
        self.query(command).map(|_| ())
    }

    fn query_number<T: FromStr>(&mut self, command: &str) -> Result<T> {
        let reply = self.query(command)?;
        parse_number(command, &reply)
    }

    fn query_capabilities(&mut self) -> Result<Capabilities> {
        match self.query("SYS:CAPS?") {
            Ok(reply) => Ok(serde_json::from_str(&reply)?),
            Err(BoardError::Protocol { .. }) => {
                warn!("Firmware does not report capabilities, assuming a minimal feature set");
                Ok(Capabilities {
                    led_brightness: false,
                    pmt_reference_voltage: false,
                    ..Capabilities::default()
                })
            }
            Err(e) => Err(e),
        }
    }
}

impl ZStage for MrBox {
    fn zstage_home(&mut self) -> Result<()> {
        info!("Homing z-stage");
        self.query_slow("ZSTAGE:HOME", MOTION_TIMEOUT).map(|_| ())
    }

    fn zstage_move_to(&mut self, position: f64) -> Result<()> {
        info!("Moving z-stage to {:.3}", position);
        self.query_slow(&format!("ZSTAGE:MOVE {}", position), MOTION_TIMEOUT).map(|_| ())
    }

    fn zstage_position(&mut self) -> Result<f64> {
        self.query_number("ZSTAGE:POS?")
    }

    fn zstage_is_down(&mut self) -> Result<bool> {
        let reply = self.query("ZSTAGE:DOWN?")?;
        parse_bool("ZSTAGE:DOWN?", &reply)
    }
}

impl Pump for MrBox {
    fn pump_activate(&mut self) -> Result<()> {
        self.command("PUMP:ON")
    }

    fn pump_deactivate(&mut self) -> Result<()> {
        self.command("PUMP:OFF")
    }

    fn pump_set_frequency(&mut self, frequency_hz: f64) -> Result<()> {
        info!("Setting pump frequency to {} Hz", frequency_hz);
        self.command(&format!("PUMP:FREQ {}", frequency_hz))
    }
}

impl PmtShutter for MrBox {
    fn pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<()> {
        self.command(&format!("PIN:MODE {} {}", pin, mode as u8))
    }

    fn pmt_open_shutter(&mut self) -> Result<()> {
        self.command("PMT:SHUTTER OPEN")
    }

    fn pmt_close_shutter(&mut self) -> Result<()> {
        self.command("PMT:SHUTTER CLOSE")
    }

    fn pmt_set_pot(&mut self, steps: u8) -> Result<()> {
        info!("Setting PMT digipot to {}", steps);
        self.command(&format!("PMT:POT {}", steps))
    }

    fn pmt_reference_voltage(&mut self) -> Result<f64> {
        if !self.capabilities.pmt_reference_voltage {
            return Err(BoardError::Unsupported("PMT reference voltage readback"));
        }
        self.query_number("PMT:VREF?")
    }
}

impl Adc for MrBox {
    fn adc_begin(&mut self) -> Result<()> {
        info!("Starting ADC and running self calibration");
        self.query_slow("ADC:BEGIN", ADC_BEGIN_TIMEOUT).map(|_| ())
    }

    fn adc_self_cal_gain(&mut self) -> Result<u32> {
        self.query_number("ADC:SCGC?")
    }

    fn adc_set_self_cal_gain(&mut self, value: u32) -> Result<()> {
        self.command(&format!("ADC:SCGC {}", value))
    }

    fn adc_self_cal_offset(&mut self) -> Result<u32> {
        self.query_number("ADC:SCOC?")
    }

    fn adc_set_self_cal_offset(&mut self, value: u32) -> Result<()> {
        self.command(&format!("ADC:SCOC {}", value))
    }

    fn adc_set_sys_offset_cal(&mut self, value: u32) -> Result<()> {
        self.command(&format!("ADC:SOC {}", value))
    }

    fn adc_set_sys_gain_cal(&mut self, value: u32) -> Result<()> {
        self.command(&format!("ADC:SGC {}", value))
    }

    fn adc_set_gain(&mut self, gain: AdcGain) -> Result<()> {
        self.command(&format!("ADC:GAIN {}", gain.value()))
    }

    fn adc_calibration(&mut self) -> Result<AdcCalibration> {
        let reply = self.query("ADC:CAL?")?;
        let values: Vec<u32> = parse_list("ADC:CAL?", &reply)?;
        match values.as_slice() {
            [self_cal_offset, self_cal_gain, sys_offset_cal, sys_gain_cal] => Ok(AdcCalibration {
                self_cal_offset: *self_cal_offset,
                self_cal_gain: *self_cal_gain,
                sys_offset_cal: *sys_offset_cal,
                sys_gain_cal: *sys_gain_cal,
            }),
            _ => Err(BoardError::Parse(format!(
                "expected 4 calibration registers, got {}",
                values.len()
            ))),
        }
    }

    fn adc_read(&mut self, rate_hz: f64, count: usize) -> Result<Vec<u32>> {
        if !(rate_hz > 0.0) {
            return Err(BoardError::InvalidOption(format!("ADC rate must be positive, got {}", rate_hz)));
        }
        let command = format!("ADC:READ {} {}", rate_hz, count);
        // The read blocks on the board for the whole acquisition
        let expected = Duration::try_from_secs_f64(count as f64 / rate_hz)
            .map_err(|e| BoardError::InvalidOption(format!("{} samples at {} Hz: {}", count, rate_hz, e)))?;
        let reply = self.query_slow(&command, expected + READ_SLACK)?;
        let samples: Vec<u32> = parse_list(&command, &reply)?;
        if samples.len() != count {
            return Err(BoardError::Parse(format!(
                "expected {} samples, got {}",
                count,
                samples.len()
            )));
        }
        Ok(samples)
    }
}

impl Leds for MrBox {
    fn led_on(&mut self, led: Led) -> Result<bool> {
        let command = format!("LED{}:ON?", led.index());
        let reply = self.query(&command)?;
        parse_bool(&command, &reply)
    }

    fn set_led_on(&mut self, led: Led, on: bool) -> Result<()> {
        self.command(&format!("LED{}:ON {}", led.index(), on as u8))
    }

    fn led_brightness(&mut self, led: Led) -> Result<f64> {
        if !self.capabilities.led_brightness {
            return Err(BoardError::Unsupported("LED brightness"));
        }
        self.query_number(&format!("LED{}:BRIGHT?", led.index()))
    }

    fn set_led_brightness(&mut self, led: Led, brightness: f64) -> Result<()> {
        if !self.capabilities.led_brightness {
            return Err(BoardError::Unsupported("LED brightness"));
        }
        self.command(&format!("LED{}:BRIGHT {}", led.index(), brightness))
    }
}

impl Board for MrBox {
    fn port(&self) -> &str {
        &self.port_name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn config(&mut self) -> Result<BoardConfig> {
        let reply = self.query("SYS:CONFIG?")?;
        Ok(serde_json::from_str(&reply)?)
    }

    fn properties(&mut self) -> Result<BTreeMap<String, String>> {
        let reply = self.query("SYS:PROPS?")?;
        Ok(parse_properties(&reply))
    }

    fn host_software_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn remote_software_version(&mut self) -> Result<String> {
        self.query("SYS:VERSION?")
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            info!("Closed serial port {}", self.port_name);
        }
        Ok(())
    }
}

/// Opens [`MrBox`] sessions on the configured port.
pub struct SerialConnector {
    settings: SerialSettings,
}

impl SerialConnector {
    pub fn new(settings: SerialSettings) -> Self {
        SerialConnector { settings }
    }
}

impl BoardConnector for SerialConnector {
    fn connect(&mut self) -> Result<Box<dyn Board>> {
        Ok(Box::new(MrBox::open(&self.settings)?))
    }
}

fn parse_reply(command: &str, line: &str) -> Result<String> {
    if line == "OK" {
        return Ok(String::new());
    }
    if let Some(payload) = line.strip_prefix("OK ") {
        return Ok(payload.trim().to_string());
    }
    let reply = line.strip_prefix("ERR").map(str::trim).unwrap_or(line);
    Err(BoardError::Protocol {
        command: command.to_string(),
        reply: reply.to_string(),
    })
}

fn parse_number<T: FromStr>(command: &str, reply: &str) -> Result<T> {
    reply
        .trim()
        .parse::<T>()
        .map_err(|_| BoardError::Parse(format!("`{}` replied with non-numeric `{}`", command, reply)))
}

fn parse_bool(command: &str, reply: &str) -> Result<bool> {
    match reply.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(BoardError::Parse(format!("`{}` replied with non-boolean `{}`", command, other))),
    }
}

fn parse_list<T: FromStr>(command: &str, reply: &str) -> Result<Vec<T>> {
    if reply.trim().is_empty() {
        return Ok(Vec::new());
    }
    reply.split(',').map(|value| parse_number(command, value)).collect()
}

fn parse_properties(reply: &str) -> BTreeMap<String, String> {
    reply
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}
