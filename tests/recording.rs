use mrbox_peripheral::clock::{CancelToken, ManualClock};
use mrbox_peripheral::config::{ConnectionSettings, Settings};
use mrbox_peripheral::connection::ConnectionManager;
use mrbox_peripheral::devices::mock::{MockBoard, MockConnector};
use mrbox_peripheral::experiment::record::{SAMPLES_FILE, STEP_LOG_FILE, SUMMARY_FILE};
use mrbox_peripheral::experiment::{NdjsonRecorder, StepOptions, StepOrchestrator};
use mrbox_peripheral::prompt::AutoAnswer;
use std::sync::Arc;

#[test]
fn protocol_run_writes_series_and_summary() {
    let dir = tempfile::tempdir().unwrap();
    let board = MockBoard::new();
    let clock = Arc::new(ManualClock::new());
    let connection = ConnectionManager::new(
        Box::new(MockConnector::new(board.clone())),
        ConnectionSettings::default(),
        clock.clone(),
    );
    let recorder = NdjsonRecorder::new(dir.path()).unwrap();
    let mut orchestrator = StepOrchestrator::new(connection, recorder, Settings::default(), clock, CancelToken::new());
    assert!(orchestrator.connect());

    let protocol: Vec<StepOptions> = serde_json::from_str(
        r#"[
            { "measure_pmt": true, "measurement_duration_s": 1, "label": "background" },
            { "magnet_engaged": true },
            { "measure_pmt": true, "measurement_duration_s": 2, "adc_gain": 4 }
        ]"#,
    )
    .unwrap();
    for (index, options) in protocol.iter().enumerate() {
        assert!(orchestrator.apply(index + 1, options).succeeded());
    }
    assert!(orchestrator.finish_protocol(&mut AutoAnswer(false)));

    assert!(dir.path().join("PMT_readings-step0001.ndjson").exists());
    assert!(!dir.path().join("PMT_readings-step0002.ndjson").exists());
    assert!(dir.path().join("PMT_readings-step0003.ndjson").exists());

    let steps = std::fs::read_to_string(dir.path().join(STEP_LOG_FILE)).unwrap();
    assert_eq!(steps.lines().count(), 3);

    let mut summary = csv::Reader::from_path(dir.path().join(SUMMARY_FILE)).unwrap();
    let rows: Vec<csv::StringRecord> = summary.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(&rows[0][0], "background");
    assert_eq!(&rows[0][3], "20");
    assert_eq!(&rows[1][0], "PMT_readings-step0003");
    assert_eq!(&rows[1][3], "30");
    assert_eq!(&rows[1][5], "4");

    let mut samples = csv::Reader::from_path(dir.path().join(SAMPLES_FILE)).unwrap();
    assert_eq!(samples.records().count(), 50);
}

#[test]
fn finishing_without_measurements_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let board = MockBoard::new();
    let clock = Arc::new(ManualClock::new());
    let connection = ConnectionManager::new(
        Box::new(MockConnector::new(board)),
        ConnectionSettings::default(),
        clock.clone(),
    );
    let recorder = NdjsonRecorder::new(dir.path()).unwrap();
    let mut orchestrator = StepOrchestrator::new(connection, recorder, Settings::default(), clock, CancelToken::new());

    assert!(orchestrator.finish_protocol(&mut AutoAnswer(false)));
    assert!(!dir.path().join(SUMMARY_FILE).exists());
}
