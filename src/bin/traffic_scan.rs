//! traffic_scan - segment a video source and count objects per segment
//!
//! This tool:
//! 1. Loads settings from the JSON store (writing defaults on first use)
//! 2. Applies command-line overrides, optionally saving them back
//! 3. Runs the pipeline on a background worker, streaming progress lines
//! 4. Stops cleanly on Ctrl-C, keeping the segments already processed

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;

use traffic_scan::detect::format_counts;
use traffic_scan::pipeline::summary_lines;
use traffic_scan::ui::Ui;
use traffic_scan::{worker, DetectionPolicy, RunState, Settings, SettingsStore, SourceKind};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Settings file (defaults to $TRAFFIC_SCAN_CONFIG or config.json).
    #[arg(long)]
    config: Option<String>,
    /// Capture source: file, rtsp or screen.
    #[arg(long)]
    source: Option<String>,
    /// Video file to process (file source).
    #[arg(long)]
    video: Option<String>,
    /// Stream URL, credentials may be embedded (rtsp source).
    #[arg(long)]
    rtsp_url: Option<String>,
    /// Directory receiving run folders.
    #[arg(long)]
    output: Option<String>,
    /// Detector model: an ONNX file, or stub://fixed?car=2 for a synthetic detector.
    #[arg(long)]
    model: Option<String>,
    /// Segment length in seconds.
    #[arg(long)]
    segment_length: Option<f64>,
    /// Capture limit in seconds for rtsp/screen sources (0 = until Ctrl-C).
    #[arg(long)]
    duration: Option<u64>,
    /// ffmpeg capture device for the screen source.
    #[arg(long)]
    screen_device: Option<String>,
    /// Keep going when the detector fails on a segment.
    #[arg(long)]
    skip_failed_segments: bool,
    /// Persist the merged settings back to the settings file.
    #[arg(long)]
    save: bool,
    /// Progress display: auto, plain or pretty.
    #[arg(long)]
    ui: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::from_flag(args.ui.as_deref(), std::io::stderr().is_terminal())?;

    let store = match &args.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::from_env(),
    };
    let mut settings = store
        .load()
        .with_context(|| format!("load settings from {}", store.path().display()))?;
    settings.apply_env()?;
    apply_args(&mut settings, &args)?;
    settings.validate()?;

    if args.save {
        store.save(&settings)?;
        log::info!("settings saved to {}", store.path().display());
    }

    log::info!(
        "traffic_scan: {} source {}, {}s segments, model {}",
        settings.source,
        settings.source_location(),
        settings.segment_length_sec,
        settings.yolo_model_path
    );

    let handle = worker::spawn(settings)?;
    let cancel = handle.cancel_flag();
    ctrlc::set_handler(move || {
        log::info!("stop requested, finishing the current segment...");
        cancel.cancel();
    })
    .context("install Ctrl-C handler")?;

    let mut stage = ui.stage("processing");
    let outcome = handle.wait(|line| stage.println(line));
    let report = match outcome {
        Ok(report) => report,
        Err(err) => {
            stage.fail();
            drop(stage);
            return Err(err.context("run failed"));
        }
    };
    if report.state == RunState::Failed {
        stage.fail();
    }
    drop(stage);

    for line in summary_lines(&report.results) {
        println!("{line}");
    }
    if !report.results.is_empty() {
        println!("Total: {}", format_counts(&report.results.totals()));
    }
    if let Some(dir) = &report.run_dir {
        println!("Artifacts: {}", dir.display());
    }

    match report.state {
        RunState::Failed => Err(anyhow!(
            "{}",
            report
                .failure
                .unwrap_or_else(|| "run failed".to_string())
        )),
        _ => Ok(()),
    }
}

fn apply_args(settings: &mut Settings, args: &Args) -> Result<()> {
    if let Some(source) = &args.source {
        settings.source = source.parse()?;
    }
    if let Some(video) = &args.video {
        settings.video_path = video.clone();
    }
    if let Some(url) = &args.rtsp_url {
        settings.rtsp_url = url.clone();
    }
    if let Some(output) = &args.output {
        settings.output_folder = output.clone();
    }
    if let Some(model) = &args.model {
        settings.yolo_model_path = model.clone();
    }
    if let Some(seconds) = args.segment_length {
        settings.segment_length_sec = seconds;
    }
    if let Some(duration) = args.duration {
        match settings.source {
            SourceKind::Rtsp => settings.rtsp_duration_sec = duration,
            SourceKind::Screen => settings.screen_duration_sec = duration,
            SourceKind::File => log::warn!("--duration is ignored for file sources"),
        }
    }
    if let Some(device) = &args.screen_device {
        settings.screen_device = Some(device.clone());
    }
    if args.skip_failed_segments {
        settings.on_detection_error = DetectionPolicy::Skip;
    }
    Ok(())
}
