//! Ingot Runtime - orchestration layer for the Ingot consumer framework.
//!
//! This crate provides:
//! - The application facade ([`Ingot`]) collecting settings and handlers
//! - Binding sessions ([`BindingSession`]) driving connect → assert → bind →
//!   consume against a [`Broker`](ingot_core::Broker)
//! - Configuration loading (files, profiles, environment)
//! - Logging configuration
//!
//! ```ignore
//! use ingot_runtime::Ingot;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = Ingot::builder().build()?;
//!     app.handler(parse_json).handler(store);
//!
//!     // Consume until Ctrl+C
//!     app.run().await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;

// Re-exports
pub use app::{Ingot, IngotBuilder};
pub use config::{ConfigError, ConfigLoader, ConfigResult, IngotConfig, LoggingConfig};
pub use error::{AssertionStep, RuntimeError, RuntimeResult, SessionError, SessionResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use session::{BindingSession, SessionHandle, SessionState};

// Re-export tracing for use by handler crates
pub use tracing;

/// Logging macros for handler code.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
