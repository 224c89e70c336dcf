//! Drives every subsystem to its safe default.

use crate::config::LedSettings;
use crate::connection::ConnectionManager;
use crate::devices::{Board, Led, PinMode};
use crate::error::Result;
use tracing::{debug, info, warn};

pub struct BoardStateController {
    leds: LedSettings,
}

impl BoardStateController {
    pub fn new(leds: LedSettings) -> Self {
        BoardStateController { leds }
    }

    pub fn set_led_settings(&mut self, leds: LedSettings) {
        self.leds = leds;
    }

    /// Reset the connected board. Does nothing when there is no session.
    pub fn reset(&self, connection: &mut ConnectionManager) -> Result<()> {
        match connection.board_mut() {
            Some(board) => self.reset_board(board),
            None => {
                debug!("No board connected, skipping reset");
                Ok(())
            }
        }
    }

    /// Pump and PMT are quiesced before the ADC calibrates, and the LEDs come
    /// back last.
    pub fn reset_board(&self, board: &mut dyn Board) -> Result<()> {
        info!("Resetting board state to defaults");

        // Magnet away from the cartridge
        board.zstage_home()?;
        // Safety check: the stage should report its end stop
        match board.zstage_is_down() {
            Ok(true) => {}
            Ok(false) => warn!("Unable to verify z-stage is in homed position."),
            Err(e) => warn!("Unable to verify z-stage is in homed position: {}", e),
        }

        // Pump off at zero frequency
        board.pump_deactivate()?;
        board.pump_set_frequency(0.0)?;

        // Shutter closed and PMT supply at 0 V
        let shutter_pin = board.capabilities().shutter_pin;
        board.pin_mode(shutter_pin, PinMode::Output)?;
        board.pmt_close_shutter()?;
        board.pmt_set_pot(0)?;

        board.adc_begin()?;

        // Illumination back on at the configured brightness
        self.update_leds(board)?;
        for led in Led::ALL {
            board.set_led_on(led, true)?;
        }
        Ok(())
    }

    /// Apply the configured LED brightness.
    pub fn update_leds(&self, board: &mut dyn Board) -> Result<()> {
        if !board.capabilities().led_brightness {
            debug!("Firmware has no LED brightness control");
            return Ok(());
        }
        info!(
            "Setting LED brightness to {:.2} / {:.2}",
            self.leds.led1_brightness, self.leds.led2_brightness
        );
        board.set_led_brightness(Led::One, self.leds.led1_brightness)?;
        board.set_led_brightness(Led::Two, self.leds.led2_brightness)?;
        Ok(())
    }
}
