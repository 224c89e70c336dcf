//! Yes/no confirmations that block the orchestration thread until answered.

use std::io::{self, BufRead, Write};
use tracing::warn;

pub trait UserPrompt: Send {
    fn confirm(&mut self, message: &str) -> bool;
}

/// Answers every question the same way. Used for unattended runs.
#[derive(Debug, Clone, Copy)]
pub struct AutoAnswer(pub bool);

impl UserPrompt for AutoAnswer {
    fn confirm(&mut self, message: &str) -> bool {
        warn!("{} -> answering {}", message, if self.0 { "yes" } else { "no" });
        self.0
    }
}

/// Asks on the terminal. Anything other than `y`/`yes` is a no.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl UserPrompt for TerminalPrompt {
    fn confirm(&mut self, message: &str) -> bool {
        print!("{} [y/N] ", message);
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(e) => {
                warn!("Could not read answer from terminal: {}", e);
                false
            }
        }
    }
}
