//! Runtime error types.

use std::fmt;

use ingot_core::BrokerError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::session::SessionState;

/// The declaration step a broker rejected while binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionStep {
    Exchange {
        name: String,
    },
    Queue {
        name: String,
    },
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

impl fmt::Display for AssertionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exchange { name } => write!(f, "exchange '{name}'"),
            Self::Queue { name } if name.is_empty() => f.write_str("server-named queue"),
            Self::Queue { name } => write!(f, "queue '{name}'"),
            Self::Bind {
                queue,
                exchange,
                routing_key,
            } => write!(
                f,
                "binding of queue '{queue}' to exchange '{exchange}' with key '{routing_key}'"
            ),
        }
    }
}

/// Errors that move a binding session to `Failed`.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The broker was unreachable, refused the credentials, or would not
    /// open a channel.
    #[error("Failed to connect to broker: {0}")]
    Connection(#[source] BrokerError),

    /// The broker rejected a topology declaration.
    #[error("Broker rejected {step}: {source}")]
    Assertion {
        step: AssertionStep,
        #[source]
        source: BrokerError,
    },

    /// The broker refused to start the consumer.
    #[error("Failed to start consuming: {0}")]
    Consume(#[source] BrokerError),

    /// `start` was called on a session that already left `Idle`.
    #[error("Session already started (state: {0})")]
    AlreadyStarted(SessionState),
}

impl SessionError {
    /// Returns the broker error behind this failure, if any.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            Self::Connection(e) | Self::Consume(e) | Self::Assertion { source: e, .. } => Some(e),
            Self::AlreadyStarted(_) => None,
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the application facade.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// The session stopped without a shutdown request.
    #[error("Session ended unexpectedly (state: {0})")]
    SessionEnded(SessionState),

    /// Shutdown signal handlers could not be installed.
    #[error("Failed to listen for shutdown signals: {0}")]
    Signal(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
