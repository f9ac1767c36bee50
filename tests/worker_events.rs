use traffic_scan::worker::{self, error_log_path, WorkerEvent};
use traffic_scan::{RunState, Settings, SourceKind};

fn settings_in(dir: &std::path::Path) -> Settings {
    Settings {
        video_path: "stub://lane?fps=5&frames=12&width=8&height=8".to_string(),
        output_folder: dir.display().to_string(),
        yolo_model_path: "stub://fixed?car=1".to_string(),
        segment_length_sec: 1.0,
        ..Settings::default()
    }
}

#[test]
fn background_run_streams_lines_then_finishes() {
    let dir = tempfile::tempdir().expect("temp dir");
    let handle = worker::spawn(settings_in(dir.path())).expect("spawn worker");

    let mut lines = Vec::new();
    let report = handle
        .wait(|line| lines.push(line.to_string()))
        .expect("run finishes");

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.results.indices(), vec![1, 2, 3]);
    assert!(lines.iter().any(|line| line == "processing segment 1"));
    assert!(lines.iter().any(|line| line == "processing final segment 3"));
    assert!(!error_log_path(&settings_in(dir.path())).exists());
}

#[test]
fn cancel_stops_an_endless_stream() {
    let dir = tempfile::tempdir().expect("temp dir");
    let settings = Settings {
        source: SourceKind::Rtsp,
        rtsp_url: "stub://camera?fps=25&width=16&height=8".to_string(),
        ..settings_in(dir.path())
    };
    let handle = worker::spawn(settings).expect("spawn worker");

    // Wait for the first processed segment before asking it to stop.
    loop {
        match handle.events().recv().expect("worker alive") {
            WorkerEvent::Log(line) if line.starts_with("segment 1:") => break,
            WorkerEvent::Log(_) => continue,
            other => panic!("run ended early: {:?}", other),
        }
    }
    handle.cancel_flag().cancel();

    let report = handle.wait(|_| {}).expect("run finishes");
    assert_eq!(report.state, RunState::Cancelled);
    assert!(report.results.indices().starts_with(&[1]));
}

#[test]
fn detector_that_cannot_load_is_written_to_error_log() {
    let dir = tempfile::tempdir().expect("temp dir");
    let settings = Settings {
        yolo_model_path: "stub://bogus".to_string(),
        ..settings_in(dir.path())
    };
    let log_path = error_log_path(&settings);
    let handle = worker::spawn(settings).expect("spawn worker");

    let err = handle.wait(|_| {}).expect_err("run fails");

    assert!(format!("{:#}", err).contains("stub://bogus"));
    let contents = std::fs::read_to_string(&log_path).expect("error log written");
    assert!(contents.contains("unknown stub detector"));
}

#[test]
fn detector_failure_mid_run_is_reported_as_failed() {
    let dir = tempfile::tempdir().expect("temp dir");
    let settings = Settings {
        yolo_model_path: "stub://fixed?car=1&fail_on=2".to_string(),
        ..settings_in(dir.path())
    };
    let log_path = error_log_path(&settings);
    let handle = worker::spawn(settings).expect("spawn worker");

    let mut lines = Vec::new();
    let err = handle
        .wait(|line| lines.push(line.to_string()))
        .expect_err("run fails");

    assert!(format!("{:#}", err).contains("segment 2"));
    assert!(lines.iter().any(|line| line.starts_with("segment 2 failed")));
    assert!(log_path.exists());
}

#[test]
fn unopenable_source_finishes_as_failed_run() {
    let dir = tempfile::tempdir().expect("temp dir");
    let settings = Settings {
        source: SourceKind::Rtsp,
        rtsp_url: "stub://camera?unavailable=1".to_string(),
        ..settings_in(dir.path())
    };
    let handle = worker::spawn(settings).expect("spawn worker");

    let mut lines = Vec::new();
    let report = handle
        .wait(|line| lines.push(line.to_string()))
        .expect("failed runs are still reported");

    assert_eq!(report.state, RunState::Failed);
    assert!(report.results.is_empty());
    assert_eq!(lines.len(), 1);
    assert!(report.failure.is_some());
}
