//! Lifecycle of the single serial session with the board.

use crate::clock::{CancelToken, Clock, sleep_cancellable};
use crate::config::{ConnectionSettings, FirmwareSettings};
use crate::devices::{Board, BoardConnector, CommandFlasher, FirmwareFlasher};
use crate::error::{BoardError, Result};
use crate::prompt::{AutoAnswer, UserPrompt};
use semver::Version;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct ConnectionManager {
    connector: Box<dyn BoardConnector>,
    prompt: Box<dyn UserPrompt>,
    flasher: Box<dyn FirmwareFlasher>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    settings: ConnectionSettings,
    board: Option<Box<dyn Board>>,
    /// Bumped on every successful `open`.
    session: u64,
    warned_disconnected: bool,
}

impl ConnectionManager {
    pub fn new(connector: Box<dyn BoardConnector>, settings: ConnectionSettings, clock: Arc<dyn Clock>) -> Self {
        ConnectionManager {
            connector,
            prompt: Box::new(AutoAnswer(false)),
            flasher: Box::new(CommandFlasher::new(FirmwareSettings::default())),
            clock,
            cancel: CancelToken::new(),
            settings,
            board: None,
            session: 0,
            warned_disconnected: false,
        }
    }

    pub fn with_prompt(mut self, prompt: Box<dyn UserPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_flasher(mut self, flasher: Box<dyn FirmwareFlasher>) -> Self {
        self.flasher = flasher;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Try to establish the session, retrying link failures. Never fails:
    /// on exhaustion the handle is simply left unset.
    pub fn open(&mut self) -> bool {
        self.warned_disconnected = false;
        let attempts = self.settings.retry_count.max(1);

        for attempt in 1..=attempts {
            self.close();
            match self.attempt() {
                Ok(board) => {
                    self.board = Some(board);
                    self.session += 1;
                    return true;
                }
                Err(e) if e.is_link_error() => {
                    warn!("Connection attempt {}/{} failed: {}", attempt, attempts, e);
                    if attempt < attempts {
                        if let Err(e) = sleep_cancellable(&*self.clock, self.settings.retry_backoff(), &self.cancel) {
                            info!("Stopped retrying connection: {}", e);
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("Connection attempt {}/{} failed: {}", attempt, attempts, e);
                    break;
                }
            }
        }

        warn!("Serial connection to peripheral board could not be established.");
        false
    }

    fn attempt(&mut self) -> Result<Box<dyn Board>> {
        let board = self.connector.connect()?;
        let mut board = self.verify_firmware(board)?;

        info!(
            "Serial connection to peripheral board **successfully established** on port `{}`",
            board.port()
        );
        match board.properties() {
            Ok(properties) => info!("Peripheral board properties: {:?}", properties),
            Err(e) => warn!("Could not read peripheral board properties: {}", e),
        }
        Ok(board)
    }

    /// Compare driver and firmware versions, offering a reflash on a
    /// major/minor mismatch. Returns the (possibly reopened) session.
    fn verify_firmware(&mut self, mut board: Box<dyn Board>) -> Result<Box<dyn Board>> {
        let host = board.host_software_version();
        let remote = match board.remote_software_version() {
            Ok(remote) => remote,
            Err(e) => {
                if let Err(close_err) = board.close() {
                    warn!("Error closing board connection: {}", close_err);
                }
                return Err(e);
            }
        };
        if versions_compatible(&host, &remote) {
            return Ok(board);
        }

        let message = format!(
            "The MR-box peripheral board firmware version ({}) does not match the driver version ({}). Update firmware?",
            remote, host
        );
        if !self.prompt.confirm(&message) {
            warn!("Continuing with firmware {} against driver {}", remote, host);
            return Ok(board);
        }

        let port = board.port().to_string();
        if let Err(e) = board.close() {
            warn!("Failed to release {} before flashing: {}", port, e);
        }
        if let Err(e) = self.flasher.flash(&port) {
            error!("Problem flashing firmware. {}", e);
        }

        // Reconnect and report what the board is running now
        let mut board = self.connector.connect()?;
        match board.remote_software_version() {
            Ok(remote) if versions_compatible(&host, &remote) => {
                info!("Peripheral board firmware is now {}", remote)
            }
            Ok(remote) => warn!(
                "Peripheral board firmware ({}) still does not match the driver version ({})",
                remote, host
            ),
            Err(e) => warn!("Could not read firmware version after update: {}", e),
        }
        Ok(board)
    }

    pub fn close(&mut self) {
        if let Some(mut board) = self.board.take() {
            if let Err(e) = board.close() {
                warn!("Error closing board connection: {}", e);
            }
        }
    }

    /// Identifies the current session. Changes whenever a new one is opened.
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn is_connected(&self) -> bool {
        self.board.is_some()
    }

    pub fn board_mut(&mut self) -> Option<&mut (dyn Board + 'static)> {
        self.board.as_deref_mut()
    }

    pub fn board_or_err(&mut self) -> Result<&mut (dyn Board + 'static)> {
        self.board_mut().ok_or(BoardError::NotConnected)
    }

    /// Warn that the board is missing, once per disconnect episode.
    pub fn warn_not_connected(&mut self) {
        if !self.warned_disconnected {
            warn!("Cannot apply board settings since board is not connected.");
            self.warned_disconnected = true;
        }
    }
}

/// Major and minor must match; micro differences are compatible.
pub fn versions_compatible(host: &str, remote: &str) -> bool {
    match (parse_version(host), parse_version(remote)) {
        (Some(host), Some(remote)) => host.major == remote.major && host.minor == remote.minor,
        _ => false,
    }
}

fn parse_version(text: &str) -> Option<Version> {
    let text = text.trim();
    Version::parse(text.strip_prefix('v').unwrap_or(text)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::devices::mock::{Call, MockBoard, MockConnector};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    struct CountingPrompt {
        answer: bool,
        asked: Arc<AtomicUsize>,
    }

    impl UserPrompt for CountingPrompt {
        fn confirm(&mut self, _message: &str) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    struct CountingFlasher {
        fail: bool,
        flashed: Arc<AtomicUsize>,
    }

    impl FirmwareFlasher for CountingFlasher {
        fn flash(&mut self, _port: &str) -> Result<()> {
            self.flashed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(BoardError::Firmware("programmer not found".into()))
            } else {
                Ok(())
            }
        }
    }

    fn manager(connector: &MockConnector, clock: Arc<ManualClock>) -> ConnectionManager {
        ConnectionManager::new(Box::new(connector.clone()), ConnectionSettings::default(), clock)
    }

    #[test]
    #[traced_test]
    fn gives_up_after_two_link_failures() {
        let connector = MockConnector::new(MockBoard::new());
        connector.fail_next(2);
        let clock = Arc::new(ManualClock::new());
        let mut manager = manager(&connector, clock.clone());

        assert!(!manager.open());
        assert!(!manager.is_connected());
        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("could not be established")).count() {
                1 => Ok(()),
                n => Err(format!("expected one warning, saw {}", n)),
            }
        });
    }

    #[test]
    fn recovers_on_second_attempt() {
        let connector = MockConnector::new(MockBoard::new());
        connector.fail_next(1);
        let mut manager = manager(&connector, Arc::new(ManualClock::new()));

        assert!(manager.open());
        assert!(manager.board_mut().is_some());
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[test]
    fn cancelled_backoff_stops_retrying() {
        let connector = MockConnector::new(MockBoard::new());
        connector.fail_next(5);
        let token = CancelToken::new();
        token.cancel();
        let mut manager = manager(&connector, Arc::new(ManualClock::new())).with_cancel_token(token);

        assert!(!manager.open());
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[test]
    fn reopening_closes_the_stale_session() {
        let board = MockBoard::new();
        let connector = MockConnector::new(board.clone());
        let mut manager = manager(&connector, Arc::new(ManualClock::new()));

        assert!(manager.open());
        assert!(manager.open());
        assert_eq!(board.calls(), vec![Call::Close]);
        assert!(!board.is_closed());
    }

    #[test]
    fn mismatch_offers_reflash() {
        let board = MockBoard::new();
        board.set_versions("1.3.0", "1.2.4");
        let connector = MockConnector::new(board.clone());
        let asked = Arc::new(AtomicUsize::new(0));
        let flashed = Arc::new(AtomicUsize::new(0));
        let mut manager = manager(&connector, Arc::new(ManualClock::new()))
            .with_prompt(Box::new(CountingPrompt {
                answer: true,
                asked: asked.clone(),
            }))
            .with_flasher(Box::new(CountingFlasher {
                fail: false,
                flashed: flashed.clone(),
            }));

        assert!(manager.open());
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert_eq!(flashed.load(Ordering::SeqCst), 1);
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[test]
    #[traced_test]
    fn version_is_checked_again_after_reflash() {
        let board = MockBoard::new();
        board.set_versions("1.3.0", "1.2.4");
        let connector = MockConnector::new(board);
        let mut manager = manager(&connector, Arc::new(ManualClock::new()))
            .with_prompt(Box::new(AutoAnswer(true)))
            .with_flasher(Box::new(CountingFlasher {
                fail: false,
                flashed: Arc::new(AtomicUsize::new(0)),
            }));

        assert!(manager.open());
        assert!(logs_contain("still does not match the driver version"));
    }

    #[test]
    #[traced_test]
    fn close_failure_after_version_error_is_logged() {
        let board = MockBoard::new();
        board.fail_on("remote_software_version");
        board.fail_on("close");
        let connector = MockConnector::new(board);
        let mut manager = manager(&connector, Arc::new(ManualClock::new()));

        assert!(!manager.open());
        assert!(logs_contain("Error closing board connection"));
    }

    #[test]
    fn session_changes_on_every_open() {
        let connector = MockConnector::new(MockBoard::new());
        let mut manager = manager(&connector, Arc::new(ManualClock::new()));
        assert_eq!(manager.session(), 0);

        assert!(manager.open());
        let first = manager.session();
        manager.close();
        assert_eq!(manager.session(), first);
        assert!(manager.open());
        assert_ne!(manager.session(), first);
    }

    #[test]
    #[traced_test]
    fn failed_flash_does_not_break_connection() {
        let board = MockBoard::new();
        board.set_versions("2.0.0", "1.9.0");
        let connector = MockConnector::new(board);
        let flashed = Arc::new(AtomicUsize::new(0));
        let mut manager = manager(&connector, Arc::new(ManualClock::new()))
            .with_prompt(Box::new(AutoAnswer(true)))
            .with_flasher(Box::new(CountingFlasher {
                fail: true,
                flashed: flashed.clone(),
            }));

        assert!(manager.open());
        assert_eq!(flashed.load(Ordering::SeqCst), 1);
        assert!(logs_contain("Problem flashing firmware"));
    }

    #[test]
    fn declined_mismatch_keeps_session() {
        let board = MockBoard::new();
        board.set_versions("1.3.0", "1.1.0");
        let connector = MockConnector::new(board);
        let flashed = Arc::new(AtomicUsize::new(0));
        let mut manager = manager(&connector, Arc::new(ManualClock::new())).with_flasher(Box::new(CountingFlasher {
            fail: false,
            flashed: flashed.clone(),
        }));

        assert!(manager.open());
        assert_eq!(flashed.load(Ordering::SeqCst), 0);
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let board = MockBoard::new();
        let connector = MockConnector::new(board.clone());
        let mut manager = manager(&connector, Arc::new(ManualClock::new()));
        manager.close();
        assert!(manager.open());
        manager.close();
        manager.close();
        assert!(!manager.is_connected());
        assert!(board.is_closed());
        assert!(matches!(manager.board_or_err(), Err(BoardError::NotConnected)));
    }

    #[test]
    #[traced_test]
    fn not_connected_warning_is_edge_triggered() {
        let connector = MockConnector::new(MockBoard::new());
        connector.fail_next(4);
        let mut manager = manager(&connector, Arc::new(ManualClock::new()));

        manager.open();
        manager.warn_not_connected();
        manager.warn_not_connected();
        manager.open();
        manager.warn_not_connected();
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("board is not connected")).count() {
                2 => Ok(()),
                n => Err(format!("expected one warning per episode, saw {}", n)),
            }
        });
    }

    #[test]
    fn micro_versions_are_compatible() {
        assert!(versions_compatible("1.2.0", "1.2.7"));
        assert!(versions_compatible("v0.9.1", "0.9.0+3.g1a2b3c"));
        assert!(!versions_compatible("1.2.0", "1.3.0"));
        assert!(!versions_compatible("2.2.0", "1.2.0"));
        assert!(!versions_compatible("1.2.0", "garbage"));
    }
}
