//! Error types for the remote bootstrap client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BootstrapError>;

/// Failure of a bootstrap run, classified by kind.
///
/// Context accumulates by prepending; the kind of the original failure is
/// never changed by added context, so callers can still match on it.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("IO error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out: {0}")]
    TimedOut(String),
}

impl BootstrapError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BootstrapError::Io {
            context: context.into(),
            source,
        }
    }

    /// Prefix the message with additional context, keeping the kind.
    pub fn prepend(self, msg: &str) -> Self {
        match self {
            BootstrapError::NotFound(m) => BootstrapError::NotFound(format!("{msg}: {m}")),
            BootstrapError::InvalidArgument(m) => {
                BootstrapError::InvalidArgument(format!("{msg}: {m}"))
            }
            BootstrapError::IllegalState(m) => BootstrapError::IllegalState(format!("{msg}: {m}")),
            BootstrapError::Corruption(m) => BootstrapError::Corruption(format!("{msg}: {m}")),
            BootstrapError::Remote(m) => BootstrapError::Remote(format!("{msg}: {m}")),
            BootstrapError::Io { context, source } => BootstrapError::Io {
                context: format!("{msg}: {context}"),
                source,
            },
            BootstrapError::TimedOut(m) => BootstrapError::TimedOut(format!("{msg}: {m}")),
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Prepend context to the error, preserving its kind.
    fn context<C: AsRef<str>>(self, msg: C) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<C: AsRef<str>>(self, msg: C) -> Result<T> {
        self.map_err(|e| e.prepend(msg.as_ref()))
    }
}

pub(crate) trait IoResultExt<T> {
    fn io_context<C: Into<String>>(self, context: C) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn io_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| BootstrapError::Io {
            context: context.into(),
            source: e,
        })
    }
}
