use std::io;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("format error: {0}")]
    Format(String),
    #[error("unsupported metric kind {0}")]
    UnsupportedMetric(i32),
    #[error("index has not been trained")]
    NotTrained,
    #[error("vector dim mismatch: store is {expected}, got {got}")]
    DimMismatch { expected: usize, got: usize },
}

impl Error {
    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }
}

/// Runs an i/o closure, retrying exactly once if the syscall was interrupted.
pub(crate) fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    match op() {
        Err(err) if err.kind() == io::ErrorKind::Interrupted => op(),
        other => other,
    }
}
