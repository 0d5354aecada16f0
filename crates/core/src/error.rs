use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the session store engine.
///
/// Construction is fail-fast: user-input errors (`InvalidPrefix`, `InvalidLevel`,
/// `InvalidTimestamp`, `MissingCredentials`, `NotOpen`) are returned unchanged to
/// the caller. Nothing in this crate retries internally; recovery is always the
/// caller's decision.
#[derive(Error, Debug)]
pub enum Error {
    #[error("prefix `{0}` must contain at least two `/`-separated segments")]
    InvalidPrefix(String),

    #[error("remote mode requires the DREAMLAKE_API_KEY environment variable")]
    MissingCredentials,

    #[error("session is not open; call `open` first")]
    NotOpen,

    #[error("invalid log level `{0}`")]
    InvalidLevel(String),

    #[error("`_ts` must be numeric, got `{0}`")]
    InvalidTimestamp(String),

    #[error("timed out after {0:?} waiting for lock on {1}")]
    LockTimeout(std::time::Duration, PathBuf),

    #[error("storage I/O error at {path}: {source}")]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {what} at {path}: {source}")]
    Serialization {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("remote transport error: {0}")]
    RemoteTransport(#[from] reqwest::Error),

    #[error("{0} not found")]
    NotFound(String),
}

impl Error {
    pub fn storage_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StorageIo { path: path.into(), source }
    }

    pub fn serialization(
        what: &'static str,
        path: impl Into<PathBuf>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { what, path: path.into(), source: Box::new(source) }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
