use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur while creating or removing the pipe pair.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// Failed to create the working directory for the FIFOs.
    #[error("failed to create working directory {path}: {source}")]
    Workdir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The mkfifo syscall failed.
    #[error("failed to create fifo {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The pipe files did not become visible within the deadline.
    #[error("pipes did not show up within {timeout:?} after mkfifo")]
    NeverAppeared { timeout: Duration },

    /// An I/O error occurred on a pipe path.
    #[error("pipe I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipeError>;
