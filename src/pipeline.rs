//! Run orchestration.
//!
//! A `Pipeline` drives one source through the segment accumulator, reduces every completed
//! segment to a composite and hands it to the detection gateway. Capture, reduction and
//! detection run strictly in sequence on the caller's thread.
//!
//! State machine: `Idle -> Running -> Completed | Cancelled | Failed`.
//!
//! Artifacts of one run land in `<output>/<stem>_<YYYYmmdd_HHMMSS>/`:
//! - file sources: one clip per segment, `<stem>_segment<N>.<ext>`
//! - RTSP and screen sources: one clip for the run, `<stem>_<timestamp>.<ext>`
//! - per segment: `<clip stem>_part<N>/original.jpg` and `detected.jpg`

use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::{DetectionPolicy, Settings};
use crate::detect::{format_counts, ClassCounts, DetectionGateway};
use crate::error::ScanError;
use crate::frame::Frame;
use crate::ingest::{open_source, ClipPolicy, FrameSource};
use crate::linescan::LineScan;
use crate::record::{clip_extension, write_clip, ClipWriter};
use crate::segment::{segment_capacity, Segment, SegmentAccumulator};

/// Timestamp format used in run directory and clip names.
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Receives user-facing progress lines.
pub trait LogSink: Send {
    fn line(&self, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Send,
{
    fn line(&self, message: &str) {
        self(message)
    }
}

/// Default sink: one line per message on stdout.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutLog;

impl LogSink for StdoutLog {
    fn line(&self, message: &str) {
        println!("{message}");
    }
}

/// Polled before every frame read; `true` stops capture.
pub trait StopSignal: Send {
    fn should_stop(&self) -> bool;
}

impl<F> StopSignal for F
where
    F: Fn() -> bool + Send,
{
    fn should_stop(&self) -> bool {
        self()
    }
}

/// A stop signal that never fires.
#[derive(Clone, Copy, Debug, Default)]
pub struct Never;

impl StopSignal for Never {
    fn should_stop(&self) -> bool {
        false
    }
}

/// Counts produced for one segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentCounts {
    /// 1-based position of the segment in the run.
    pub index: usize,
    pub counts: ClassCounts,
}

/// Append-only list of per-segment counts, in emission order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunResult {
    segments: Vec<SegmentCounts>,
}

impl RunResult {
    pub fn push(&mut self, index: usize, counts: ClassCounts) {
        self.segments.push(SegmentCounts { index, counts });
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentCounts> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.segments.iter().map(|segment| segment.index).collect()
    }

    /// Counts summed over every segment.
    pub fn totals(&self) -> ClassCounts {
        let mut totals = ClassCounts::new();
        for segment in &self.segments {
            for (label, count) in &segment.counts {
                *totals.entry(label.clone()).or_insert(0) += count;
            }
        }
        totals
    }
}

impl<'a> IntoIterator for &'a RunResult {
    type Item = &'a SegmentCounts;
    type IntoIter = std::slice::Iter<'a, SegmentCounts>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

/// Outcome of one run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub state: RunState,
    pub results: RunResult,
    /// Directory holding this run's artifacts, once created.
    pub run_dir: Option<PathBuf>,
    /// Why the run failed, when it did.
    pub failure: Option<String>,
}

pub struct Pipeline {
    settings: Settings,
    gateway: DetectionGateway,
    log: Box<dyn LogSink>,
    stop: Box<dyn StopSignal>,
    state: RunState,
    results: RunResult,
    run_dir: Option<PathBuf>,
}

/// Per-run bookkeeping, fixed once the run starts.
struct RunContext {
    stem: String,
    run_dir: PathBuf,
    fps: f64,
    clip_policy: ClipPolicy,
    width_divisor: u32,
    /// Set from the first frame.
    geometry: Option<(u32, u32, LineScan)>,
    run_clip: Option<ClipWriter>,
    run_clip_name: String,
    next_index: usize,
}

impl Pipeline {
    pub fn new(settings: Settings, gateway: DetectionGateway) -> Self {
        Self {
            settings,
            gateway,
            log: Box::new(StdoutLog),
            stop: Box::new(Never),
            state: RunState::Idle,
            results: RunResult::default(),
            run_dir: None,
        }
    }

    pub fn with_log(mut self, log: impl LogSink + 'static) -> Self {
        self.log = Box::new(log);
        self
    }

    pub fn with_stop(mut self, stop: impl StopSignal + 'static) -> Self {
        self.stop = Box::new(stop);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Results gathered so far; after a failed run this holds the segments that completed.
    pub fn results(&self) -> &RunResult {
        &self.results
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Open the configured source and run it to completion.
    ///
    /// A source that cannot be opened ends the run as `Failed` with an empty result and a
    /// single log line; that is reported through the returned `RunReport`, not as an error.
    pub fn run(&mut self) -> Result<RunReport> {
        self.results = RunResult::default();
        self.run_dir = None;
        let source = match open_source(&self.settings) {
            Ok(source) => source,
            Err(err) => {
                self.state = RunState::Failed;
                let message = format!(
                    "cannot open {} source {}: {:#}",
                    self.settings.source,
                    self.settings.source_location(),
                    err
                );
                self.log.line(&message);
                return Ok(self.report(Some(message)));
            }
        };
        self.run_source(source)
    }

    /// Run an already opened source. The source is closed on every exit path.
    ///
    /// Errors are fatal conditions such as a detector failure under the abort policy or an
    /// artifact that cannot be written; the state is `Failed` afterwards.
    pub fn run_source(&mut self, mut source: Box<dyn FrameSource>) -> Result<RunReport> {
        self.state = RunState::Running;
        self.results = RunResult::default();
        let outcome = self.drive(source.as_mut());
        let frames = source.frames_captured();
        source.close();
        match outcome {
            Ok(state) => {
                self.state = state;
                self.log.line(&format!(
                    "processing {}: {} segment(s), {} frame(s)",
                    state,
                    self.results.len(),
                    frames
                ));
                Ok(self.report(None))
            }
            Err(err) => {
                self.state = RunState::Failed;
                Err(err)
            }
        }
    }

    fn report(&self, failure: Option<String>) -> RunReport {
        RunReport {
            state: self.state,
            results: self.results.clone(),
            run_dir: self.run_dir.clone(),
            failure,
        }
    }

    fn drive(&mut self, source: &mut dyn FrameSource) -> Result<RunState> {
        let mut ctx = self.start_run(source)?;
        let mut accumulator = SegmentAccumulator::new(segment_capacity(
            self.settings.segment_length_sec,
            ctx.fps,
        ));
        log::info!(
            "run {}: {} source {} at {:.2} fps, {} frame(s) per segment",
            ctx.run_dir.display(),
            source.kind(),
            source.location(),
            ctx.fps,
            accumulator.capacity()
        );

        let mut final_state = RunState::Completed;
        loop {
            if self.stop.should_stop() {
                self.log.line("processing stopped by request");
                final_state = RunState::Cancelled;
                break;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    self.log.line(&format!(
                        "failed to read frame from {}: {:#}",
                        source.location(),
                        err
                    ));
                    break;
                }
            };

            if !self.accept_frame(&mut ctx, &frame)? {
                continue;
            }
            if let Some(segment) = accumulator.push(frame) {
                self.process_segment(&mut ctx, segment, false)?;
            }
        }

        if let Some(segment) = accumulator.flush() {
            self.process_segment(&mut ctx, segment, true)?;
        }
        if let Some(clip) = ctx.run_clip.take() {
            let path = clip.finish()?;
            log::info!("saved run clip {}", path.display());
        }
        Ok(final_state)
    }

    fn start_run(&mut self, source: &dyn FrameSource) -> Result<RunContext> {
        let stem = source.artifact_stem();
        let timestamp = chrono::Local::now().format(RUN_TIMESTAMP_FORMAT).to_string();
        let run_name = format!("{}_{}", stem, timestamp);
        let run_dir = self.settings.output_dir().join(&run_name);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("create run directory {}", run_dir.display()))?;
        self.run_dir = Some(run_dir.clone());

        let kind = source.kind();
        Ok(RunContext {
            stem,
            run_dir,
            fps: source.effective_fps(),
            clip_policy: kind.clip_policy(),
            width_divisor: kind.width_divisor(),
            geometry: None,
            run_clip: None,
            run_clip_name: format!("{}.{}", run_name, clip_extension()),
            next_index: 1,
        })
    }

    /// Fix the run geometry on the first frame; drop frames of any other size.
    fn accept_frame(&mut self, ctx: &mut RunContext, frame: &Frame) -> Result<bool> {
        let (width, height) = frame.dimensions();
        match ctx.geometry {
            None => {
                let scan = LineScan::for_frame(width, height, ctx.width_divisor);
                log::debug!(
                    "sampling row {} into {} px strips",
                    scan.sample_row,
                    scan.target_width
                );
                ctx.geometry = Some((width, height, scan));
                if ctx.clip_policy == ClipPolicy::PerRun {
                    let path = ctx.run_dir.join(&ctx.run_clip_name);
                    ctx.run_clip = Some(ClipWriter::create(&path, ctx.fps, width, height)?);
                }
            }
            Some((w, h, _)) if (w, h) != (width, height) => {
                log::warn!(
                    "dropping {}x{} frame in a {}x{} run",
                    width,
                    height,
                    w,
                    h
                );
                return Ok(false);
            }
            Some(_) => {}
        }
        if let Some(clip) = ctx.run_clip.as_mut() {
            clip.write(frame)?;
        }
        Ok(true)
    }

    fn process_segment(&mut self, ctx: &mut RunContext, segment: Segment, last: bool) -> Result<()> {
        let index = ctx.next_index;
        ctx.next_index += 1;

        let artifact_name = match ctx.clip_policy {
            ClipPolicy::PerSegment => {
                let name = format!("{}_segment{}.{}", ctx.stem, index, clip_extension());
                write_clip(&ctx.run_dir.join(&name), ctx.fps, segment.frames())?;
                name
            }
            ClipPolicy::PerRun => ctx.run_clip_name.clone(),
        };

        if last {
            self.log.line(&format!("processing final segment {}", index));
        } else {
            self.log.line(&format!("processing segment {}", index));
        }

        let scan = match ctx.geometry {
            Some((_, _, scan)) => scan,
            None => return Err(ScanError::EmptyInput.into()),
        };
        let composite = scan.reduce(segment.frames())?;
        drop(segment);

        match self
            .gateway
            .detect(&composite, &ctx.run_dir, &artifact_name, index)
        {
            Ok(counts) => {
                self.log
                    .line(&format!("segment {}: {}", index, format_counts(&counts)));
                self.results.push(index, counts);
                Ok(())
            }
            Err(err) if self.skips(&err) => {
                self.log
                    .line(&format!("segment {} skipped: {:#}", index, err));
                Ok(())
            }
            Err(err) => {
                self.log
                    .line(&format!("segment {} failed: {:#}", index, err));
                Err(err)
            }
        }
    }

    fn skips(&self, err: &anyhow::Error) -> bool {
        self.settings.on_detection_error == DetectionPolicy::Skip
            && matches!(
                err.downcast_ref::<ScanError>(),
                Some(ScanError::Detection { .. })
            )
    }
}

/// Human-readable per-segment listing, one `Segment N: label: n, ...` line each.
pub fn summary_lines(results: &RunResult) -> Vec<String> {
    results
        .iter()
        .map(|segment| format!("Segment {}: {}", segment.index, format_counts(&segment.counts)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_every_segment() {
        let mut results = RunResult::default();
        results.push(1, ClassCounts::from([("car".to_string(), 2)]));
        results.push(
            2,
            ClassCounts::from([("car".to_string(), 1), ("bus".to_string(), 4)]),
        );
        let totals = results.totals();
        assert_eq!(totals.get("car"), Some(&3));
        assert_eq!(totals.get("bus"), Some(&4));
        assert_eq!(results.indices(), vec![1, 2]);
    }

    #[test]
    fn summary_matches_listing_format() {
        let mut results = RunResult::default();
        results.push(1, ClassCounts::from([("car".to_string(), 3), ("truck".to_string(), 1)]));
        results.push(2, ClassCounts::new());
        assert_eq!(
            summary_lines(&results),
            vec!["Segment 1: car: 3, truck: 1", "Segment 2: none"]
        );
    }

    #[test]
    fn closures_are_collaborators() {
        let sink = |line: &str| assert!(!line.is_empty());
        sink.line("hello");
        let stop = || true;
        assert!(stop.should_stop());
        assert!(!Never.should_stop());
    }
}
