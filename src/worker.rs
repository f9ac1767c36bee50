//! Supervised background run.
//!
//! `spawn` moves a whole pipeline run onto a dedicated thread so the host never blocks.
//! The worker talks back over a one-way channel: log lines while running, then exactly
//! one `Finished` or `Failed`. The host stops the run through a shared `CancelFlag`, which
//! the pipeline polls before every frame read.
//!
//! Failures and panics never escape the thread. Their full diagnostic is appended to
//! `<output>/error.log` before the `Failed` event is sent.

use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::Settings;
use crate::detect::DetectionGateway;
use crate::pipeline::{Pipeline, RunReport, RunState, StopSignal};

pub const ERROR_LOG_FILE: &str = "error.log";

/// Shared cancellation flag: written by the host, read by the worker.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl StopSignal for CancelFlag {
    fn should_stop(&self) -> bool {
        self.is_cancelled()
    }
}

/// Notifications from the worker to its host.
#[derive(Debug)]
pub enum WorkerEvent {
    Log(String),
    /// The run ended; `state` tells completed, cancelled and unopenable-source runs apart.
    Finished(RunReport),
    /// The run hit a fatal error or panicked.
    Failed(String),
}

pub struct WorkerHandle {
    events: Receiver<WorkerEvent>,
    cancel: CancelFlag,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain events until the final one and wait for the thread to exit.
    ///
    /// `on_log` sees every log line as it arrives.
    pub fn wait(mut self, mut on_log: impl FnMut(&str)) -> Result<RunReport> {
        let outcome = loop {
            match self.events.recv() {
                Ok(WorkerEvent::Log(line)) => on_log(&line),
                Ok(WorkerEvent::Finished(report)) => break Ok(report),
                Ok(WorkerEvent::Failed(message)) => break Err(anyhow!(message)),
                Err(_) => break Err(anyhow!("worker exited without reporting")),
            }
        };
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("worker thread panicked after reporting");
            }
        }
        outcome
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.cancel.cancel();
            let _ = join.join();
        }
    }
}

/// Start a run on a new thread. The detector is loaded on that thread.
pub fn spawn(settings: Settings) -> Result<WorkerHandle> {
    let (tx, rx) = unbounded();
    let cancel = CancelFlag::new();
    let cancel_thread = cancel.clone();
    let join = std::thread::Builder::new()
        .name("traffic-scan-worker".to_string())
        .spawn(move || supervise(settings, tx, cancel_thread))
        .context("spawn worker thread")?;

    Ok(WorkerHandle {
        events: rx,
        cancel,
        join: Some(join),
    })
}

fn supervise(settings: Settings, tx: Sender<WorkerEvent>, cancel: CancelFlag) {
    let error_log = error_log_path(&settings);
    let log_tx = tx.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| run_worker(settings, log_tx, cancel)));

    let event = match outcome {
        Ok(Ok(report)) => WorkerEvent::Finished(report),
        Ok(Err(err)) => {
            append_error_log(&error_log, &format!("{:?}", err));
            WorkerEvent::Failed(format!("{:#}", err))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            append_error_log(&error_log, &format!("worker panicked: {}", message));
            WorkerEvent::Failed(format!("worker panicked: {}", message))
        }
    };
    if tx.send(event).is_err() {
        log::warn!("worker host went away before the run ended");
    }
}

fn run_worker(settings: Settings, tx: Sender<WorkerEvent>, cancel: CancelFlag) -> Result<RunReport> {
    let gateway = DetectionGateway::open(&settings.yolo_model_path)
        .with_context(|| format!("load detector {}", settings.yolo_model_path))?;
    let sink_tx = tx.clone();
    let mut pipeline = Pipeline::new(settings, gateway)
        .with_log(move |line: &str| {
            let _ = sink_tx.send(WorkerEvent::Log(line.to_string()));
        })
        .with_stop(cancel);

    let report = pipeline.run()?;
    if report.state == RunState::Failed {
        if let Some(reason) = &report.failure {
            log::warn!("run failed: {}", reason);
        }
    }
    Ok(report)
}

/// `<output>/error.log`, or `./error.log` when no output folder is configured.
pub fn error_log_path(settings: &Settings) -> PathBuf {
    settings.output_dir().join(ERROR_LOG_FILE)
}

fn append_error_log(path: &Path, diagnostic: &str) {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "[{}] {}", timestamp, diagnostic));
    if let Err(err) = result {
        log::error!("cannot write {}: {}", path.display(), err);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.should_stop());
        flag.cancel();
        assert!(observer.should_stop());
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }
}
