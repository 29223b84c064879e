//! Configuration validation utilities.

use ingot_core::Settings;
use tracing::warn;

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogOutput, LoggingConfig};

/// Validates logging settings.
pub fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File {
        if logging.file_path.is_none() {
            return Err(ConfigError::missing_field("logging.file_path"));
        }
        if logging.max_files == 0 {
            return Err(ConfigError::validation(
                "logging.max_files must be greater than 0",
            ));
        }
    }
    Ok(())
}

/// Checks that `settings` describe a binding a session can start from.
///
/// `host` and `aggregate` are required. Setting only one of `user` and
/// `password` is allowed (the URL then carries no credentials) but logged,
/// as is an empty routing-key list, which leaves the queue unbound.
pub fn validate_settings(settings: &Settings) -> ConfigResult<()> {
    if settings.host.trim().is_empty() {
        return Err(ConfigError::missing_field("host"));
    }
    if settings.aggregate.trim().is_empty() {
        return Err(ConfigError::missing_field("aggregate"));
    }

    if settings.user.is_empty() != settings.password.is_empty() {
        warn!(
            user_set = !settings.user.is_empty(),
            password_set = !settings.password.is_empty(),
            "Only one of user and password is set; connecting without credentials"
        );
    }
    if settings.events.is_empty() {
        warn!(
            exchange = %settings.aggregate,
            "No routing keys configured; the queue will not be bound"
        );
    }

    Ok(())
}
