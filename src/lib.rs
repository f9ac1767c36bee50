//! Traffic Scan
//!
//! Periodic object counts from long video sources without running every frame through a
//! detector.
//!
//! # Architecture
//!
//! A run pulls frames from one source (a video file, an RTSP stream or the screen), cuts
//! the stream into fixed-duration segments and reduces each segment to one line-scan
//! composite: the row at a quarter of the frame height is sampled from every frame, shrunk
//! with area averaging and stacked top-to-bottom. Each composite goes through the detector
//! once, and the per-class instance counts are collected by segment index.
//!
//! # Module Structure
//!
//! - `frame`: decoded RGB frames
//! - `linescan`: composite reduction
//! - `segment`: capacity rule and segment accumulator
//! - `ingest`: file, RTSP and screen sources behind `FrameSource`
//! - `record`: raw clip persistence
//! - `detect`: detector backends and the detection gateway
//! - `pipeline`: the run state machine and its log/stop collaborators
//! - `worker`: supervised background runs with cancellation
//! - `config`: persisted settings

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod linescan;
pub mod pipeline;
pub mod record;
pub mod segment;
pub mod ui;
pub mod worker;

pub use config::{DetectionPolicy, Settings, SettingsStore};
pub use detect::{ClassCounts, DetectionGateway, DetectorBackend, StubBackend};
pub use error::ScanError;
pub use frame::Frame;
pub use ingest::{
    effective_fps, open_source, FileConfig, FileSource, FrameSource, RtspConfig, RtspSource,
    ScreenConfig, ScreenSource, SourceKind,
};
pub use linescan::{reduce, LineScan};
pub use pipeline::{
    LogSink, Never, Pipeline, RunReport, RunResult, RunState, SegmentCounts, StdoutLog,
    StopSignal,
};
pub use segment::{segment_capacity, Segment, SegmentAccumulator};
pub use worker::{CancelFlag, WorkerEvent, WorkerHandle};
