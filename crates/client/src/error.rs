//! Client error taxonomy and per-dataset outcomes

use std::io;

use chrono::{DateTime, FixedOffset};
use reqwest::StatusCode;
use thiserror::Error;

use hubsync_core::archive::ExtractError;

/// Errors that terminate a single dataset's sync
///
/// Per-dataset errors never abort the sibling datasets; `sync_all`
/// collects one result per dataset.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The hub's listing has no entry for this dataset
    #[error("dataset `{0}` is not published by the hub")]
    DatasetUnknown(String),

    /// Transient failures exhausted the retry budget
    #[error("giving up after {attempts} attempts: {last}")]
    NetworkTransient { attempts: u32, last: String },

    /// The hub rejected the request in a way retries cannot fix
    #[error("hub answered HTTP {status}")]
    NetworkTerminal { status: StatusCode },

    /// The downloaded archive does not match the advertised size
    #[error("downloaded {actual} bytes, hub advertised {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The archive cannot be read; the current local copy is preserved
    #[error("archive is invalid: {0}")]
    ArchiveInvalid(String),

    /// An archive entry tried to escape the staging directory
    #[error("archive entry `{entry}` attempts path traversal")]
    ZipSlipDetected { entry: String },

    /// The atomic directory swap failed and was rolled back
    #[error("failed to swap dataset directory: {0}")]
    SwapFailed(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The sync state document could not be written
    #[error("failed to record sync state: {0}")]
    State(String),
}

impl SyncError {
    /// Map extraction failures onto the client taxonomy
    #[must_use]
    pub fn from_extract(err: ExtractError) -> Self {
        match err {
            ExtractError::UnsafeEntryPath { entry } => Self::ZipSlipDetected { entry },
            other => Self::ArchiveInvalid(other.to_string()),
        }
    }
}

/// Successful end state of one dataset sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A new version was downloaded and installed
    Synced { version: DateTime<FixedOffset> },
    /// The local copy already matches the hub
    UpToDate,
}

/// Result of syncing one dataset within `sync_all`
#[derive(Debug)]
pub struct DatasetReport {
    pub dataset: String,
    pub result: Result<SyncOutcome, SyncError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_slip_maps_to_its_own_kind() {
        let err = SyncError::from_extract(ExtractError::UnsafeEntryPath {
            entry: "../evil".to_string(),
        });
        assert!(matches!(err, SyncError::ZipSlipDetected { .. }));
    }

    #[test]
    fn test_corruption_maps_to_archive_invalid() {
        let err = SyncError::from_extract(ExtractError::Io(io::Error::other("truncated")));
        assert!(matches!(err, SyncError::ArchiveInvalid(_)));
    }
}
