use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use traffic_scan::config::{DetectionPolicy, Settings};
use traffic_scan::detect::gateway::{ANNOTATED_FILE, ORIGINAL_FILE};
use traffic_scan::record::clip_extension;
use traffic_scan::{
    effective_fps, segment_capacity, DetectionGateway, Frame, FrameSource, Pipeline, RunState,
    ScanError, SourceKind, StubBackend,
};

/// Endless source of solid frames; counts how many it has produced.
struct CountingSource {
    produced: Arc<AtomicU64>,
    fps: f64,
    size: (u32, u32),
    odd_size_every: Option<u64>,
}

impl CountingSource {
    fn new(fps: f64) -> (Self, Arc<AtomicU64>) {
        let produced = Arc::new(AtomicU64::new(0));
        let source = Self {
            produced: produced.clone(),
            fps,
            size: (16, 8),
            odd_size_every: None,
        };
        (source, produced)
    }
}

impl FrameSource for CountingSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn location(&self) -> String {
        "memory://counting".to_string()
    }

    fn artifact_stem(&self) -> String {
        "counting".to_string()
    }

    fn effective_fps(&self) -> f64 {
        effective_fps(self.fps)
    }

    fn frame_dimensions(&self) -> (u32, u32) {
        self.size
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let n = self.produced.fetch_add(1, Ordering::SeqCst) + 1;
        let (width, height) = match self.odd_size_every {
            Some(every) if n % every == 0 => (self.size.0 * 2, self.size.1),
            _ => self.size,
        };
        Frame::filled(width, height, [(n % 255) as u8, 80, 160]).map(Some)
    }

    fn frames_captured(&self) -> u64 {
        self.produced.load(Ordering::SeqCst)
    }
}

fn settings_in(dir: &Path) -> Settings {
    Settings {
        output_folder: dir.display().to_string(),
        yolo_model_path: "stub://fixed?car=2&truck=1".to_string(),
        segment_length_sec: 1.0,
        ..Settings::default()
    }
}

fn collecting_log() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Send + 'static) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = lines.clone();
    let sink = move |line: &str| sink_lines.lock().unwrap().push(line.to_string());
    (lines, sink)
}

fn stub_gateway(reference: &str) -> DetectionGateway {
    DetectionGateway::open(reference).expect("stub detector")
}

#[test]
fn cancellation_after_two_segments_keeps_both() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings_in(dir.path());
    // 1s segments at 5 fps: capacity 5.
    let (source, produced) = CountingSource::new(5.0);
    let stop_counter = produced.clone();

    let mut pipeline = Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path))
        .with_stop(move || stop_counter.load(Ordering::SeqCst) >= 10)
        .with_log(|_: &str| {});

    let report = pipeline.run_source(Box::new(source))?;

    assert_eq!(report.state, RunState::Cancelled);
    assert_eq!(pipeline.state(), RunState::Cancelled);
    assert_eq!(report.results.indices(), vec![1, 2]);
    assert_eq!(produced.load(Ordering::SeqCst), 10);
    Ok(())
}

#[test]
fn cancelled_run_still_processes_buffered_frames() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings_in(dir.path());
    let (source, produced) = CountingSource::new(5.0);
    let stop_counter = produced.clone();

    let mut pipeline = Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path))
        .with_stop(move || stop_counter.load(Ordering::SeqCst) >= 7)
        .with_log(|_: &str| {});

    let report = pipeline.run_source(Box::new(source))?;

    assert_eq!(report.state, RunState::Cancelled);
    assert_eq!(report.results.indices(), vec![1, 2]);
    Ok(())
}

#[test]
fn unreliable_fps_falls_back_to_twenty() -> Result<()> {
    assert_eq!(segment_capacity(10.0, effective_fps(-1.0)), 200);

    let dir = tempfile::tempdir()?;
    let settings = Settings {
        video_path: "stub://lane?fps=-1&frames=450&width=8&height=8".to_string(),
        segment_length_sec: 10.0,
        ..settings_in(dir.path())
    };
    let mut pipeline = Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path))
        .with_log(|_: &str| {});

    let report = pipeline.run()?;

    // 450 frames at 200 per segment: two full segments and a 50-frame remainder.
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.results.indices(), vec![1, 2, 3]);
    Ok(())
}

#[test]
fn missing_file_fails_with_one_log_line() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        video_path: dir.path().join("nope.mp4").display().to_string(),
        ..settings_in(dir.path())
    };
    let (lines, sink) = collecting_log();
    let mut pipeline =
        Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path)).with_log(sink);

    let report = pipeline.run()?;

    assert_eq!(report.state, RunState::Failed);
    assert!(report.results.is_empty());
    assert!(report.run_dir.is_none());
    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 1, "log lines: {:?}", *lines);
    assert!(lines[0].contains("nope.mp4"));
    Ok(())
}

#[test]
fn fixed_distribution_round_trips_through_a_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        video_path: "stub://junction?fps=10&frames=25&width=32&height=16".to_string(),
        ..settings_in(dir.path())
    };
    let mut pipeline = Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path))
        .with_log(|_: &str| {});

    let report = pipeline.run()?;

    assert_eq!(report.results.indices(), vec![1, 2, 3]);
    for segment in &report.results {
        assert_eq!(segment.counts.get("car"), Some(&2));
        assert_eq!(segment.counts.get("truck"), Some(&1));
    }
    let totals = report.results.totals();
    assert_eq!(totals.get("car"), Some(&6));
    assert_eq!(totals.get("truck"), Some(&3));
    Ok(())
}

#[test]
fn file_run_writes_per_segment_artifacts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        video_path: "stub://junction?fps=10&frames=15&width=32&height=16".to_string(),
        ..settings_in(dir.path())
    };
    let mut pipeline = Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path))
        .with_log(|_: &str| {});

    let report = pipeline.run()?;

    let run_dir = report.run_dir.expect("run directory");
    let run_name = run_dir.file_name().unwrap().to_string_lossy().into_owned();
    assert!(run_name.starts_with("junction_"));
    assert!(run_dir.starts_with(dir.path()));
    for index in [1, 2] {
        let clip = format!("junction_segment{}.{}", index, clip_extension());
        assert!(run_dir.join(&clip).is_file(), "missing {}", clip);
        let part = run_dir.join(format!("junction_segment{}_part{}", index, index));
        assert!(part.join(ORIGINAL_FILE).is_file());
        assert!(part.join(ANNOTATED_FILE).is_file());
    }

    // 32 px wide file frames shrink by half; one composite row per frame.
    let composite = image::open(
        run_dir
            .join("junction_segment2_part2")
            .join(ORIGINAL_FILE),
    )?;
    assert_eq!((composite.width(), composite.height()), (16, 5));
    Ok(())
}

#[test]
fn stream_run_records_one_clip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        source: SourceKind::Rtsp,
        rtsp_url: "stub://camera?fps=10&frames=25&width=64&height=16".to_string(),
        ..settings_in(dir.path())
    };
    let mut pipeline = Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path))
        .with_log(|_: &str| {});

    let report = pipeline.run()?;

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.results.indices(), vec![1, 2, 3]);
    let run_dir = report.run_dir.expect("run directory");
    let run_name = run_dir.file_name().unwrap().to_string_lossy().into_owned();
    assert!(run_name.starts_with("rtsp_capture_"));
    let clip = run_dir.join(format!("{}.{}", run_name, clip_extension()));
    assert!(clip.is_file());
    let part = run_dir.join(format!("{}_part3", run_name));
    // 64 px stream frames shrink by 16; the trailing segment holds 5 frames.
    let composite = image::open(part.join(ORIGINAL_FILE))?;
    assert_eq!((composite.width(), composite.height()), (4, 5));
    Ok(())
}

fn clips_in(dir: &Path) -> Result<Vec<String>> {
    let suffix = format!(".{}", clip_extension());
    let mut clips = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.ends_with(&suffix) {
            clips.push(name);
        }
    }
    clips.sort();
    Ok(clips)
}

fn assert_contiguous(indices: &[usize]) {
    let expected: Vec<usize> = (1..=indices.len()).collect();
    assert_eq!(indices, expected.as_slice());
}

#[test]
fn screen_run_records_one_clip_at_an_eighth_width() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        source: SourceKind::Screen,
        screen_device: Some("stub://desk?width=80&height=16&frames=30".to_string()),
        ..settings_in(dir.path())
    };
    let mut pipeline = Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path))
        .with_log(|_: &str| {});

    let report = pipeline.run()?;

    // Screen capture runs at 20 fps: 1s segments of 20 frames, then a 10-frame remainder.
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.results.indices(), vec![1, 2]);
    let run_dir = report.run_dir.expect("run directory");
    let run_name = run_dir.file_name().unwrap().to_string_lossy().into_owned();
    assert!(run_name.starts_with("screen_capture_"));
    assert_eq!(
        clips_in(&run_dir)?,
        vec![format!("{}.{}", run_name, clip_extension())]
    );

    let first = image::open(run_dir.join(format!("{}_part1", run_name)).join(ORIGINAL_FILE))?;
    assert_eq!((first.width(), first.height()), (10, 20));
    let last = image::open(run_dir.join(format!("{}_part2", run_name)).join(ORIGINAL_FILE))?;
    assert_eq!((last.width(), last.height()), (10, 10));
    Ok(())
}

#[test]
fn screen_duration_limit_ends_the_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        source: SourceKind::Screen,
        screen_device: Some("stub://desk?width=16&height=8".to_string()),
        screen_duration_sec: 1,
        ..settings_in(dir.path())
    };
    let mut pipeline = Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path))
        .with_log(|_: &str| {});

    let started = Instant::now();
    let report = pipeline.run()?;

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(report.state, RunState::Completed);
    assert!(!report.results.is_empty());
    assert_contiguous(&report.results.indices());
    Ok(())
}

#[test]
fn rtsp_duration_limit_ends_the_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        source: SourceKind::Rtsp,
        rtsp_url: "stub://camera?fps=10&width=32&height=8".to_string(),
        rtsp_duration_sec: 1,
        ..settings_in(dir.path())
    };
    let (lines, sink) = collecting_log();
    // Each detection takes 50ms, which keeps the endless feed from flooding the run.
    let mut pipeline = Pipeline::new(settings, stub_gateway("stub://fixed?car=1&delay_ms=50"))
        .with_log(sink);

    let started = Instant::now();
    let report = pipeline.run()?;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(30));
    assert_eq!(report.state, RunState::Completed);
    assert!(!report.results.is_empty());
    assert_contiguous(&report.results.indices());
    assert!(lines
        .lock()
        .unwrap()
        .iter()
        .any(|line| line.starts_with("processing completed")));

    let run_dir = report.run_dir.expect("run directory");
    let clips = clips_in(&run_dir)?;
    assert_eq!(clips.len(), 1);
    assert!(clips[0].starts_with("rtsp_capture_"));
    Ok(())
}

#[test]
fn read_failure_ends_the_run_and_flushes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        video_path: "stub://lane?fps=5&frames=100&fail_at=8&width=8&height=8".to_string(),
        ..settings_in(dir.path())
    };
    let (lines, sink) = collecting_log();
    let mut pipeline =
        Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path)).with_log(sink);

    let report = pipeline.run()?;

    assert_eq!(report.state, RunState::Completed);
    // Segment 1 holds frames 1-5; frames 6-7 are flushed as segment 2.
    assert_eq!(report.results.indices(), vec![1, 2]);
    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|line| line.contains("failed to read frame")));
    assert!(lines.iter().any(|line| line == "processing final segment 2"));
    Ok(())
}

#[test]
fn odd_sized_frames_are_dropped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings_in(dir.path());
    let (mut source, produced) = CountingSource::new(5.0);
    source.odd_size_every = Some(3);
    let stop_counter = produced.clone();

    let mut pipeline = Pipeline::new(settings.clone(), stub_gateway(&settings.yolo_model_path))
        .with_stop(move || stop_counter.load(Ordering::SeqCst) >= 15)
        .with_log(|_: &str| {});

    let report = pipeline.run_source(Box::new(source))?;

    // 15 frames, every third one dropped: 10 usable frames, two segments.
    assert_eq!(report.results.indices(), vec![1, 2]);
    Ok(())
}

#[test]
fn detection_failure_aborts_by_default() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        video_path: "stub://lane?fps=5&frames=15&width=8&height=8".to_string(),
        ..settings_in(dir.path())
    };
    let mut pipeline = Pipeline::new(
        settings,
        stub_gateway("stub://fixed?car=1&fail_on=2"),
    )
    .with_log(|_: &str| {});

    let err = match pipeline.run() {
        Ok(report) => panic!("run should fail, got {:?}", report.state),
        Err(err) => err,
    };

    assert!(matches!(
        err.downcast_ref::<ScanError>(),
        Some(ScanError::Detection { segment: 2, .. })
    ));
    assert_eq!(pipeline.state(), RunState::Failed);
    assert_eq!(pipeline.results().indices(), vec![1]);
    Ok(())
}

#[test]
fn detection_failure_can_be_skipped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        video_path: "stub://lane?fps=5&frames=15&width=8&height=8".to_string(),
        on_detection_error: DetectionPolicy::Skip,
        ..settings_in(dir.path())
    };
    let (lines, sink) = collecting_log();
    let mut pipeline =
        Pipeline::new(settings, stub_gateway("stub://fixed?car=1&fail_on=2")).with_log(sink);

    let report = pipeline.run()?;

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.results.indices(), vec![1, 3]);
    assert!(lines
        .lock()
        .unwrap()
        .iter()
        .any(|line| line.starts_with("segment 2 skipped")));
    Ok(())
}

#[test]
fn custom_backend_plugs_into_the_gateway() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = Settings {
        video_path: "stub://lane?fps=5&frames=5&width=8&height=8".to_string(),
        ..settings_in(dir.path())
    };
    let gateway = DetectionGateway::new(Box::new(StubBackend::fixed([("bus", 4)])));
    let mut pipeline = Pipeline::new(settings, gateway).with_log(|_: &str| {});

    let report = pipeline.run()?;

    assert_eq!(report.results.totals().get("bus"), Some(&4));
    Ok(())
}
