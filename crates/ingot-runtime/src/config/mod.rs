//! Configuration module for the Ingot runtime.
//!
//! Configuration is loaded with figment from files and environment variables
//! (see [`loader`]) into an [`IngotConfig`], whose `broker` section is the
//! same [`Settings`](ingot_core::Settings) structure the application facade
//! works with.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{IngotConfig, LogFormat, LogLevel, LogOutput, LoggingConfig, SpanEventConfig};
pub use validation::{validate_logging, validate_settings};
