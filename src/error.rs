use std::path::PathBuf;

use thiserror::Error;

/// Failure classes a target can run into on its way from address to output file.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Credentials missing or unusable. Fatal for the worker's whole queue.
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),

    /// Transport error, timeout, or an HTTP status >= 400. Retried.
    #[error("navigation to {address} failed: {reason}")]
    NavigationFailed { address: String, reason: String },

    /// Warning only: the fetch still returns the document.
    #[error("structural marker '{marker}' not found on {address}")]
    StructuralMarkerMissing { address: String, marker: String },

    /// Page loaded but nothing matched. Retried, then reported as a plain failure.
    #[error("no extractable content on {0}")]
    EmptyExtraction(String),

    /// Never triggers a re-fetch.
    #[error("failed to write {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad descriptor {path}: {reason}")]
    Descriptor { path: PathBuf, reason: String },
}

impl ScrapeError {
    pub fn navigation(address: &str, reason: impl ToString) -> Self {
        ScrapeError::NavigationFailed {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ScrapeError::WriteFailure {
            path: path.into(),
            source,
        }
    }

    /// Whether the retry controller may resubmit the target after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScrapeError::NavigationFailed { .. } | ScrapeError::EmptyExtraction(_)
        )
    }
}

// ── Tests ──
