use std::{io, path::PathBuf};

use reqwest::StatusCode;
use thiserror::Error;

pub type CoopResult<T> = Result<T, CoopError>;

#[derive(Debug, Error)]
pub enum CoopError {
    #[error("{path}: {source}")]
    Storage { path: PathBuf, source: io::Error },
    #[error(transparent)]
    NetWork(#[from] reqwest::Error),
    #[error("reading {url}: {source}")]
    Transfer { url: String, source: io::Error },
    /// Server answered with a status the caller cannot use.
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: StatusCode },
    #[error("part file missing: {}", .0.display())]
    MissingPart(PathBuf),
    #[error("{}: expected {expected} bytes, received {received}", .path.display())]
    Truncated {
        path: PathBuf,
        expected: u64,
        received: u64,
    },
    #[error("listing objects failed: {0}")]
    Inventory(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid download options: {0}")]
    InvalidOptions(String),
    #[error("download scheduler failed: {0}")]
    Scheduler(String),
}

impl CoopError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CoopError::Storage {
            path: path.into(),
            source,
        }
    }
}
