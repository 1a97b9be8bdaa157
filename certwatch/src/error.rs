//! Error types for certificate loading, the reload queue and the reloader.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading a certificate pair
#[derive(Debug, Error)]
pub enum CertError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {0:?}")]
    NoCertificates(PathBuf),

    #[error("No private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("Failed to parse {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Unsupported private key in {path:?}: {reason}")]
    UnsupportedKey { path: PathBuf, reason: String },

    #[error("Private key does not match certificate for {name}: {reason}")]
    KeyMismatch { name: String, reason: String },

    #[error("Certificate for {0} is not yet valid")]
    NotYetValid(String),

    #[error("Certificate for {0} has expired")]
    Expired(String),

    #[error("Certificate scan cancelled")]
    Cancelled,
}

impl CertError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the error is a missing `.crt` or `.key` file
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Errors returned by [`crate::DedupQueue::poll`]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue poll cancelled")]
    Cancelled,
}

/// Errors produced by the [`crate::Reloader`]
#[derive(Debug, Error)]
pub enum ReloaderError {
    #[error("reloader is already running")]
    AlreadyRunning,

    #[error("no certificate directories configured")]
    NoDirectories,

    #[error("invalid certificate directory {path:?}: {source}")]
    InvalidDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot reload certificates when both the reload interval and watch are disabled")]
    NoReloadSource,

    #[error("reload interval {0:?} is too large")]
    InvalidReloadInterval(std::time::Duration),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("{}", initial_load_message(.0))]
    InitialLoad(Vec<(PathBuf, CertError)>),

    #[error("no certificate for name {0}")]
    NoCertificate(String),

    #[error("reloader cancelled")]
    Cancelled,

    #[error("reloader task failed: {0}")]
    TaskFailed(String),

    #[error("{}", join_messages(.0))]
    Multiple(Vec<ReloaderError>),
}

impl ReloaderError {
    /// True when every error contained in `self` is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Multiple(errors) => !errors.is_empty() && errors.iter().all(Self::is_cancelled),
            _ => false,
        }
    }

    /// Combine the results of the two reloader loops.
    pub(crate) fn join(
        first: Result<(), ReloaderError>,
        second: Result<(), ReloaderError>,
    ) -> Result<(), ReloaderError> {
        match (first, second) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(a), Err(b)) => Err(Self::Multiple(vec![a, b])),
        }
    }
}

impl From<QueueError> for ReloaderError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Cancelled => Self::Cancelled,
        }
    }
}

fn initial_load_message(failures: &[(PathBuf, CertError)]) -> String {
    match failures {
        [(path, err)] => format!("initial certificate load failed for {path:?}: {err}"),
        _ => format!(
            "initial certificate load failed for {} directories",
            failures.len()
        ),
    }
}

fn join_messages(errors: &[ReloaderError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
