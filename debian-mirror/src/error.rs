// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Coarse classification of a [MirrorError].
///
/// Callers use this to decide whether an operation is worth retrying and how to
/// report a failure without matching on every variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Transport,
    Authentication,
    Integrity,
    Parse,
    MissingUpstreamFile,
    AlreadyExists,
    NotFound,
    InUse,
    IncompleteContent,
    NothingStaged,
    InvalidInput,
    Io,
    Cancelled,
    SyncFailed,
}

/// A file level failure recorded during a sync.
#[derive(Debug)]
pub struct FileFailure {
    /// Repository relative path of the file.
    pub path: String,
    /// What went wrong.
    pub error: MirrorError,
}

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("signature verification failed for {path}: {message}")]
    Authentication { path: String, message: String },

    #[error("integrity check failed for {path}: {message}")]
    Integrity { path: String, message: String },

    #[error("malformed metadata in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("upstream file not available: {url} ({reason})")]
    MissingUpstreamFile { url: String, reason: String },

    #[error("snapshot {name} of mirror {mirror} already exists")]
    AlreadyExists { mirror: String, name: String },

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("snapshot {name} of mirror {mirror} is referenced by the {slot} slot")]
    InUse {
        mirror: String,
        name: String,
        slot: &'static str,
    },

    #[error("content store of mirror {mirror} lacks {missing} file(s) needed for a snapshot (first: {first})")]
    IncompleteContent {
        mirror: String,
        missing: usize,
        first: String,
    },

    #[error("nothing is staged for mirror {0}")]
    NothingStaged(String),

    #[error("invalid mirror id: {0}")]
    InvalidMirrorId(String),

    #[error("invalid snapshot name: {0}")]
    InvalidSnapshotName(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid mirror configuration for {mirror}: {message}")]
    InvalidMirror { mirror: String, message: String },

    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("PGP error: {0:?}")]
    Pgp(#[from] pgp::errors::Error),

    #[error("HTTP client error: {0:?}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0:?}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("mirror {mirror}: {source}")]
    InMirror {
        mirror: String,
        #[source]
        source: Box<MirrorError>,
    },

    #[error("sync of mirror {mirror} failed: {} file(s) could not be mirrored", .failures.len())]
    SyncFailed {
        mirror: String,
        failures: Vec<FileFailure>,
    },
}

impl MirrorError {
    /// Obtain the [ErrorKind] of this error.
    ///
    /// Wrapping variants report the kind of the wrapped error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } | Self::Reqwest(_) => ErrorKind::Transport,
            Self::Authentication { .. } | Self::Pgp(_) => ErrorKind::Authentication,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Parse { .. } | Self::Json(_) => ErrorKind::Parse,
            Self::MissingUpstreamFile { .. } => ErrorKind::MissingUpstreamFile,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InUse { .. } => ErrorKind::InUse,
            Self::IncompleteContent { .. } => ErrorKind::IncompleteContent,
            Self::NothingStaged(_) => ErrorKind::NothingStaged,
            Self::InvalidMirrorId(_)
            | Self::InvalidSnapshotName(_)
            | Self::InvalidDuration(_)
            | Self::InvalidMirror { .. }
            | Self::Url(_) => ErrorKind::InvalidInput,
            Self::IoPath(..) | Self::Io(_) => ErrorKind::Io,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::InMirror { source, .. } => source.kind(),
            Self::SyncFailed { .. } => ErrorKind::SyncFailed,
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Integrity)
    }

    /// Attach a mirror ID to this error.
    pub fn in_mirror(self, mirror: impl ToString) -> Self {
        match self {
            Self::InMirror { .. } | Self::SyncFailed { .. } => self,
            _ => Self::InMirror {
                mirror: mirror.to_string(),
                source: Box::new(self),
            },
        }
    }

    pub(crate) fn io_path(path: impl AsRef<std::path::Path>, e: std::io::Error) -> Self {
        Self::IoPath(format!("{}", path.as_ref().display()), e)
    }
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, MirrorError>;
