//! Terminal progress for the CLI.
//!
//! On a TTY a stage shows an `indicatif` spinner whose message follows the latest progress
//! line; elsewhere lines are printed plainly under a `==>` header.

use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    pub fn from_flag(ui_flag: Option<&str>, is_tty: bool) -> Result<Self> {
        let mode = match ui_flag {
            None | Some("auto") => UiMode::Auto,
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            Some(other) => {
                return Err(anyhow!(
                    "unknown --ui mode '{}' (expected auto, plain or pretty)",
                    other
                ))
            }
        };
        Ok(Self::new(mode, is_tty))
    }

    fn use_pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failed: bool,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            failed: false,
        }
    }

    /// Print a progress line without tearing the spinner.
    pub fn println(&self, line: &str) {
        match &self.spinner {
            Some(spinner) => {
                spinner.println(line);
                spinner.set_message(format!("{}: {}", self.name, line));
            }
            None => eprintln!("    {}", line),
        }
    }

    /// Mark the stage as failed; the closing line says so.
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let mark = if self.failed { "✖" } else { "✔" };
        let message = format!(
            "{} {} ({})",
            mark,
            self.name,
            format_duration(self.start.elapsed())
        );
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 60 {
        format!("{}m{:02}s", duration.as_secs() / 60, duration.as_secs() % 60)
    } else if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Ui::from_flag(Some("fancy"), true).is_err());
        assert!(!Ui::from_flag(Some("plain"), true).unwrap().use_pretty());
        assert!(!Ui::from_flag(None, false).unwrap().use_pretty());
    }

    #[test]
    fn durations_read_naturally() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m05s");
    }
}
