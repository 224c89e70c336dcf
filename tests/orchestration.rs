use mrbox_peripheral::clock::{CancelToken, ManualClock};
use mrbox_peripheral::config::{ConnectionSettings, Settings};
use mrbox_peripheral::connection::ConnectionManager;
use mrbox_peripheral::devices::mock::{Call, MockBoard, MockConnector};
use mrbox_peripheral::devices::{ADC_FULL_SCALE, AdcGain, Led};
use mrbox_peripheral::experiment::{BranchOutcome, MemoryRecorder, StepOptions, StepOrchestrator};
use std::sync::Arc;

fn setup(connector: &MockConnector) -> (StepOrchestrator<MemoryRecorder>, MemoryRecorder) {
    let clock = Arc::new(ManualClock::new());
    let connection = ConnectionManager::new(Box::new(connector.clone()), ConnectionSettings::default(), clock.clone());
    let recorder = MemoryRecorder::new();
    let orchestrator = StepOrchestrator::new(connection, recorder.clone(), Settings::default(), clock, CancelToken::new());
    (orchestrator, recorder)
}

fn measure(label: Option<&str>) -> StepOptions {
    StepOptions {
        measure_pmt: true,
        measurement_duration_s: 1.0,
        label: label.map(str::to_string),
        ..StepOptions::default()
    }
}

#[test]
fn background_calibration_carries_into_later_steps() {
    let board = MockBoard::new();
    let connector = MockConnector::new(board.clone());
    let (mut orchestrator, recorder) = setup(&connector);
    assert!(orchestrator.connect());

    let background = orchestrator.apply(1, &measure(Some("background")));
    assert_eq!(background.pmt, BranchOutcome::Completed);
    let captured = board.calibration_registers();

    let sample = orchestrator.apply(2, &measure(None));
    assert_eq!(sample.pmt, BranchOutcome::Completed);

    let series = recorder.series();
    assert_eq!(series.len(), 2);
    let reused = series[1].calibration.unwrap();
    assert_eq!(reused.self_cal_gain, captured.self_cal_gain);
    assert_eq!(reused.self_cal_offset, captured.self_cal_offset);
    // The board ran a fresh self calibration for step 2; the captured values
    // were written back over it.
    assert_eq!(board.calibration_registers().self_cal_gain, captured.self_cal_gain);
    assert_eq!(recorder.logs()[1].adc_calibration.unwrap().self_cal_gain, captured.self_cal_gain);
}

#[test]
fn reconnect_forgets_background_calibration() {
    let board = MockBoard::new();
    let connector = MockConnector::new(board.clone());
    let (mut orchestrator, recorder) = setup(&connector);
    assert!(orchestrator.connect());
    orchestrator.apply(1, &measure(Some("background")));

    orchestrator.disconnect();
    assert!(orchestrator.connect());
    orchestrator.apply(2, &measure(None));

    assert_eq!(recorder.series()[1].calibration, None);
}

#[test]
fn apply_while_disconnected_touches_nothing() {
    let board = MockBoard::new();
    let connector = MockConnector::new(board.clone());
    connector.fail_next(2);
    let (mut orchestrator, recorder) = setup(&connector);

    assert!(!orchestrator.connect());
    let report = orchestrator.apply(
        1,
        &StepOptions {
            magnet_engaged: true,
            pump_enabled: true,
            ..measure(None)
        },
    );

    assert!(!report.connected);
    assert!(board.calls().is_empty());
    assert!(recorder.series().is_empty());
    orchestrator.reset();
    orchestrator.pause();
    assert!(board.calls().is_empty());
}

#[test]
fn magnet_down_goes_via_low_position() {
    let board = MockBoard::new();
    let connector = MockConnector::new(board.clone());
    let (mut orchestrator, _) = setup(&connector);
    assert!(orchestrator.connect());

    orchestrator.apply(
        1,
        &StepOptions {
            magnet_engaged: true,
            ..StepOptions::default()
        },
    );
    orchestrator.apply(2, &StepOptions::default());

    let moves: Vec<Call> = board
        .calls()
        .into_iter()
        .skip_while(|c| *c != Call::ZStageMoveTo(16.0))
        .filter(|c| matches!(c, Call::ZStageMoveTo(_) | Call::ZStageHome))
        .collect();
    assert_eq!(
        moves,
        vec![Call::ZStageMoveTo(16.0), Call::ZStageMoveTo(1.0), Call::ZStageHome]
    );
    assert_eq!(board.zstage_position_now(), 0.0);
}

#[test]
fn leds_survive_faults_at_any_point() {
    for fault in ["adc_begin", "pmt_set_pot", "adc_set_sys_gain_cal", "adc_set_gain", "pmt_open_shutter", "adc_read"] {
        let board = MockBoard::new();
        let connector = MockConnector::new(board.clone());
        let (mut orchestrator, _) = setup(&connector);
        assert!(orchestrator.connect());
        board.set_leds([false, true], [0.2, 0.8]);
        board.fail_on(fault);

        let report = orchestrator.apply(1, &measure(None));

        assert!(report.pmt.is_failed(), "{} should fail the measurement", fault);
        assert_eq!(board.leds(), ([false, true], [0.2, 0.8]), "LEDs not restored after {}", fault);
        assert!(!board.shutter_open(), "shutter left open after {}", fault);
    }
}

#[test]
fn saturated_signal_is_flagged_in_series() {
    let board = MockBoard::new();
    board.set_adc_response(|_| ADC_FULL_SCALE);
    let connector = MockConnector::new(board.clone());
    let (mut orchestrator, recorder) = setup(&connector);
    assert!(orchestrator.connect());

    orchestrator.apply(1, &measure(None));

    let series = &recorder.series()[0];
    assert_eq!(series.gain, AdcGain::X1);
    assert!(series.overrange);
    let selection = recorder.logs()[0].gain.unwrap();
    assert!(selection.overrange);
}

#[test]
fn leds_back_on_after_reset() {
    let board = MockBoard::new();
    board.set_leds([false, false], [0.0, 0.0]);
    let connector = MockConnector::new(board.clone());
    let (mut orchestrator, _) = setup(&connector);

    assert!(orchestrator.connect());

    assert_eq!(board.leds().0, [true, true]);
    assert_eq!(board.calls().last(), Some(&Call::SetLedOn(Led::Two, true)));
}
