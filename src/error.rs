use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Board not connected")]
    NotConnected,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Board rejected `{command}`: {reply}")]
    Protocol { command: String, reply: String },

    #[error("Invalid step option: {0}")]
    InvalidOption(String),

    #[error("Board does not support {0}")]
    Unsupported(&'static str),

    #[error("Firmware error: {0}")]
    Firmware(String),

    #[error("Recorder error: {0}")]
    Record(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BoardError {
    /// Errors caused by the serial link itself rather than by the board's
    /// reply to a command. These are the ones worth reopening the port for.
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            BoardError::Io(_) | BoardError::Serial(_) | BoardError::Timeout(_) | BoardError::NotConnected
        )
    }
}

pub type Result<T> = std::result::Result<T, BoardError>;
