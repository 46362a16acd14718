/// Boxed error cause carried inside a fatal [`DaemonError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced to the supervisor's caller.
///
/// Fatal errors are terminal for this supervisor instance. A retryable error
/// means the caller may construct a replacement supervisor; an irrecoverable
/// error signals it to stop reconstructing.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Terminal for this supervisor; the caller may build a new one.
    #[error("{message}")]
    Retryable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Terminal; the caller should not build a replacement.
    #[error("{message}")]
    Irrecoverable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The supervisor has shut down and no longer accepts messages.
    #[error("the child process has been shut down and can no longer accept messages")]
    ShutDown,
}

impl DaemonError {
    /// Build the fatal variant selected by `retryable`.
    pub(crate) fn fatal(
        message: impl Into<String>,
        source: Option<BoxError>,
        retryable: bool,
    ) -> Self {
        let message = message.into();
        if retryable {
            Self::Retryable { message, source }
        } else {
            Self::Irrecoverable { message, source }
        }
    }

    /// Whether this is the retryable fatal variant.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Whether this is the irrecoverable fatal variant.
    pub fn is_irrecoverable(&self) -> bool {
        matches!(self, Self::Irrecoverable { .. })
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
