// Error taxonomy for the library. Every variant carries the remote folder
// and/or the files involved so the UI can always tell the user what broke.

use std::path::PathBuf;
use thiserror::Error;

use crate::workspace::SessionState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Listing or auth against the remote store failed.
    #[error("remote storage unavailable: {reason}")]
    RemoteUnavailable { reason: String },

    /// The read-only mirror of `folder` could not be completed. The session
    /// never reached `Active` and nothing was left on disk.
    #[error("could not mirror remote folder '{folder}': {reason}")]
    SyncError { folder: String, reason: String },

    /// A single file kept failing after every retry.
    #[error("upload of '{file}' to '{folder}' failed after {attempts} attempt(s): {reason}")]
    UploadError {
        folder: String,
        file: String,
        attempts: u32,
        reason: String,
    },

    #[error("{} file(s) could not be uploaded to '{folder}': {}", failed.len(), failed.join(", "))]
    PartialFailure { folder: String, failed: Vec<String> },

    #[error("a workspace session is already open (session {session_id})")]
    SessionBusy { session_id: String },

    #[error("session {session_id}: cannot go from {from} to {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },

    #[error("no files selected for upload to '{folder}'")]
    NothingSelected { folder: String },

    #[error("closing session {session_id} deletes unuploaded work and must be confirmed")]
    CloseNotConfirmed { session_id: String },

    #[error("failed to launch editor '{program}': {source}")]
    EditorLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn remote(reason: impl std::fmt::Display) -> Self {
        Error::RemoteUnavailable {
            reason: reason.to_string(),
        }
    }

    /// Whether this error leaves the current session's scratch directory
    /// untouched and recoverable.
    pub fn keeps_scratch(&self) -> bool {
        matches!(
            self,
            Error::PartialFailure { .. } | Error::UploadError { .. } | Error::NothingSelected { .. }
        )
    }
}

/// Extension used at I/O call sites: `fs::create_dir_all(&p).at(&p)?`.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
