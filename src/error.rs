//! Error taxonomy shared by the credential store, the hosting client and the sync engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while authenticating, talking to GitHub or touching local files
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Not logged in")]
    NotAuthenticated,

    #[error("GitHub rejected the access token: {0}")]
    Auth(String),

    #[error("Request to GitHub failed: {0}")]
    Transport(String),

    #[error("GitHub rate limit still active after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Remote file '{path}' changed since it was last read")]
    Conflict { path: String },

    #[error("Remote file '{path}' not found")]
    NotFound { path: String },

    #[error("Credential store {path:?} could not be accessed: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid credential entry: {0}")]
    InvalidCredential(String),

    #[error("Could not decode remote content: {0}")]
    Decode(String),

    #[error("GitHub API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Editor files unavailable: {0}")]
    Editor(String),

    #[error("Failed to install extension '{extension}': {message}")]
    Install { extension: String, message: String },

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. })
    }

    /// Errors that mean the user has to log in again
    pub fn requires_login(&self) -> bool {
        matches!(self, SyncError::NotAuthenticated | SyncError::Auth(_))
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Transport(format!("request timed out: {}", err))
        } else {
            SyncError::Transport(err.to_string())
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
