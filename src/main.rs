use mrbox_peripheral::clock::{CancelToken, Clock, SystemClock};
use mrbox_peripheral::config::Settings;
use mrbox_peripheral::connection::ConnectionManager;
use mrbox_peripheral::devices::{CommandFlasher, SerialConnector};
use mrbox_peripheral::experiment::{NdjsonRecorder, StepOptions, StepOrchestrator};
use mrbox_peripheral::prompt::TerminalPrompt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = setup_logging();
    info!("Starting application");

    let mut args = std::env::args().skip(1);
    let Some(protocol_path) = args.next().map(PathBuf::from) else {
        eprintln!("usage: mrbox-peripheral <protocol.json> [settings.json]");
        return Err("missing protocol file".into());
    };
    let settings_path = args.next().map_or_else(|| PathBuf::from("settings.json"), PathBuf::from);

    let settings = Settings::load(&settings_path)?;
    let steps = load_protocol(&protocol_path)?;
    info!("Loaded {} steps from {}", steps.len(), protocol_path.display());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cancel = CancelToken::new();
    let connection = ConnectionManager::new(
        Box::new(SerialConnector::new(settings.serial.clone())),
        settings.connection.clone(),
        clock.clone(),
    )
    .with_prompt(Box::new(TerminalPrompt))
    .with_flasher(Box::new(CommandFlasher::new(settings.firmware.clone())))
    .with_cancel_token(cancel.clone());
    let recorder = NdjsonRecorder::new(&settings.output_dir)?;

    let mut orchestrator = StepOrchestrator::new(connection, recorder, settings, clock, cancel);
    if !orchestrator.connect() {
        error!("No board available, aborting protocol");
        return Err("peripheral board not connected".into());
    }

    orchestrator.begin_experiment();
    let mut failed = 0;
    for (index, options) in steps.iter().enumerate() {
        let report = orchestrator.apply(index + 1, options);
        if !report.succeeded() {
            warn!("Step {} did not complete: {:?}", index + 1, report);
            failed += 1;
        }
    }

    orchestrator.finish_protocol(&mut TerminalPrompt);
    orchestrator.disconnect();

    info!("Protocol finished, {} of {} steps had errors", failed, steps.len());
    println!("Protocol finished, {} of {} steps had errors", failed, steps.len());
    Ok(())
}

fn load_protocol(path: &Path) -> Result<Vec<StepOptions>, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let steps: Vec<StepOptions> = serde_json::from_str(&text)?;
    Ok(steps)
}

/// File log rotated daily under `logs/`, plus stderr. The returned guard
/// flushes the file writer and must live until exit.
fn setup_logging() -> WorkerGuard {
    let file_appender = rolling::daily("logs", "mrbox-peripheral.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    guard
}
