use crate::config::FirmwareSettings;
use crate::error::{BoardError, Result};
use std::process::Command;
use tracing::{error, info};

/// Reprograms the board firmware. The port is closed while this runs.
pub trait FirmwareFlasher: Send {
    fn flash(&mut self, port: &str) -> Result<()>;
}

/// Runs an external programmer, passing the port as the last argument.
pub struct CommandFlasher {
    settings: FirmwareSettings,
}

impl CommandFlasher {
    pub fn new(settings: FirmwareSettings) -> Self {
        CommandFlasher { settings }
    }
}

impl FirmwareFlasher for CommandFlasher {
    fn flash(&mut self, port: &str) -> Result<()> {
        let Some(program) = &self.settings.program else {
            return Err(BoardError::Firmware("no flashing program configured".into()));
        };
        info!("Flashing firmware on {} using {}", port, program);
        let status = Command::new(program)
            .args(&self.settings.args)
            .arg(port)
            .status()
            .map_err(|e| BoardError::Firmware(format!("failed to launch {}: {}", program, e)))?;
        if !status.success() {
            error!("{} exited with {}", program, status);
            return Err(BoardError::Firmware(format!("{} exited with {}", program, status)));
        }
        info!("Firmware updated successfully");
        Ok(())
    }
}
