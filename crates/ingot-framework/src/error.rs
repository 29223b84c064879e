//! Error types for the Ingot framework.

use thiserror::Error;

/// Error type returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that end the dispatch of a single message.
///
/// None of these affect other messages or the session consuming them.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A handler ran its continuation more than once.
    #[error("continuation of handler #{index} was run more than once")]
    DoubleDispatch {
        /// Position of the offending handler in the chain.
        index: usize,
    },

    /// A handler returned an error.
    #[error("handler #{index} failed: {source}")]
    Handler {
        /// Position of the failing handler in the chain.
        index: usize,
        /// The error returned by the handler.
        source: BoxError,
    },

    /// A handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    /// Wraps an error returned by the handler at `index`.
    ///
    /// A `DispatchError` coming back from a downstream continuation and
    /// forwarded with `?` is passed through unchanged.
    pub fn from_handler(index: usize, err: BoxError) -> Self {
        match err.downcast::<DispatchError>() {
            Ok(inner) => *inner,
            Err(err) => Self::Handler { index, source: err },
        }
    }

    /// Returns the chain position the error originated from, if known.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::DoubleDispatch { index } | Self::Handler { index, .. } => Some(*index),
            Self::Panicked(_) => None,
        }
    }

    pub fn is_double_dispatch(&self) -> bool {
        matches!(self, Self::DoubleDispatch { .. })
    }
}

/// Result type for a dispatch.
pub type DispatchResult = Result<(), DispatchError>;
