//! Persistence of measurement series and step logs.

use super::data::{MeasurementSeries, StepLog};
use crate::error::{BoardError, Result};
use crate::prompt::UserPrompt;
use csv::Writer;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

pub const SUMMARY_FILE: &str = "PMT_readings.csv";
pub const SAMPLES_FILE: &str = "PMT_readings-samples.csv";
pub const STEP_LOG_FILE: &str = "step_log.ndjson";

/// Exports are offered again at most this many times after a failure.
pub const MAX_EXPORT_RETRIES: usize = 3;

/// Sink for everything a protocol run produces.
pub trait Recorder: Send {
    fn record(&mut self, series: MeasurementSeries) -> Result<()>;

    fn log_step(&mut self, _log: &StepLog) -> Result<()> {
        Ok(())
    }

    /// Called once when the protocol finishes.
    fn finish(&mut self, _prompt: &mut dyn UserPrompt) -> Result<()> {
        Ok(())
    }
}

/// Writes each series as newline-delimited JSON under the output directory
/// and exports CSV summaries when the protocol finishes.
pub struct NdjsonRecorder {
    dir: PathBuf,
    series_files: Vec<PathBuf>,
}

impl NdjsonRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(NdjsonRecorder {
            dir,
            series_files: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append_json(path: &Path, value: &impl Serialize) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(value)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

impl Recorder for NdjsonRecorder {
    fn record(&mut self, series: MeasurementSeries) -> Result<()> {
        let path = self.dir.join(format!("{}.ndjson", default_series_name(series.step_number)));
        Self::append_json(&path, &series)?;
        info!("Recorded {} samples to {}", series.len(), path.display());
        if !self.series_files.contains(&path) {
            self.series_files.push(path);
        }
        Ok(())
    }

    fn log_step(&mut self, log: &StepLog) -> Result<()> {
        Self::append_json(&self.dir.join(STEP_LOG_FILE), log)
    }

    fn finish(&mut self, prompt: &mut dyn UserPrompt) -> Result<()> {
        if self.series_files.is_empty() {
            info!("No PMT readings to export");
            return Ok(());
        }
        let files = self.series_files.clone();
        let dir = self.dir.clone();
        export_with_retry(prompt, MAX_EXPORT_RETRIES, || export_summary(&files, &dir)).map(|_| ())
    }
}

/// Keeps everything in memory. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryRecorder {
    series: Arc<Mutex<Vec<MeasurementSeries>>>,
    logs: Arc<Mutex<Vec<StepLog>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn series(&self) -> Vec<MeasurementSeries> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn logs(&self) -> Vec<StepLog> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&mut self, series: MeasurementSeries) -> Result<()> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner).push(series);
        Ok(())
    }

    fn log_step(&mut self, log: &StepLog) -> Result<()> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner).push(log.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    name: &'a str,
    step_number: usize,
    started_at: String,
    samples: usize,
    mean: Option<f64>,
    gain: u8,
    overrange: bool,
}

#[derive(Debug, Serialize)]
struct SampleRow<'a> {
    name: &'a str,
    timestamp: String,
    relative_time_s: f64,
    value: f64,
}

/// Read back every recorded series and write a per-series summary plus a
/// long-format sample table. Returns the summary path.
pub fn export_summary(series_files: &[PathBuf], dir: &Path) -> Result<PathBuf> {
    let summary_path = dir.join(SUMMARY_FILE);
    let mut summary = Writer::from_writer(File::create(&summary_path)?);
    let mut samples = Writer::from_writer(File::create(dir.join(SAMPLES_FILE))?);

    for path in series_files {
        for series in read_series(path)? {
            summary.serialize(SummaryRow {
                name: &series.name,
                step_number: series.step_number,
                started_at: series.started_at.to_rfc3339(),
                samples: series.len(),
                mean: series.mean(),
                gain: series.gain.value(),
                overrange: series.overrange,
            })?;
            for sample in &series.samples {
                samples.serialize(SampleRow {
                    name: &series.name,
                    timestamp: sample.timestamp.to_rfc3339(),
                    relative_time_s: sample.relative_time_s,
                    value: sample.value,
                })?;
            }
        }
    }
    summary.flush()?;
    samples.flush()?;

    info!("PMT summary saved to {}", summary_path.display());
    Ok(summary_path)
}

fn read_series(path: &Path) -> Result<Vec<MeasurementSeries>> {
    let file = File::open(path).map_err(|e| BoardError::Record(format!("cannot read {}: {}", path.display(), e)))?;
    let reader = BufReader::new(file);
    let mut series = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        series.push(serde_json::from_str(&line)?);
    }
    Ok(series)
}

/// Run `export`, asking whether to try again after each failure, at most
/// `max_retries` times.
pub fn export_with_retry<T>(
    prompt: &mut dyn UserPrompt,
    max_retries: usize,
    mut export: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut retries = 0;
    loop {
        match export() {
            Ok(value) => return Ok(value),
            Err(e) => {
                error!("Error exporting PMT readings: {}", e);
                if retries >= max_retries || !prompt.confirm(&format!("Error exporting PMT readings: {}. Try again?", e)) {
                    warn!("Giving up on PMT export");
                    return Err(e);
                }
                retries += 1;
            }
        }
    }
}

/// Name of an unlabelled series, also the file stem every series of a step
/// is appended to.
pub fn default_series_name(step_number: usize) -> String {
    format!("PMT_readings-step{:04}", step_number)
}
