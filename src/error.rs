//! Error taxonomy for a scan run.
//!
//! Most functions in this crate return `anyhow::Result`. The variants below are raised
//! through `anyhow` wherever a caller needs to tell failures apart, and recovered with
//! `err.downcast_ref::<ScanError>()`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    /// The capture source could not be opened or connected. Fatal for the run.
    #[error("source unavailable: {location}: {reason}")]
    SourceUnavailable { location: String, reason: String },

    /// The line-scan reducer was handed zero frames. Indicates a bookkeeping bug upstream.
    #[error("line-scan reducer received no frames")]
    EmptyInput,

    /// The detector failed on one segment composite.
    #[error("detection failed on segment {segment}: {reason}")]
    Detection { segment: usize, reason: String },

    /// Persisted settings could not be read. Recovered locally with defaults.
    #[error("settings at {} are unreadable: {reason}", path.display())]
    Configuration { path: PathBuf, reason: String },
}

impl ScanError {
    pub fn source_unavailable(location: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            location: location.into(),
            reason: reason.to_string(),
        }
    }
}
