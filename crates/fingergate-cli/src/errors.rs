pub use fingergate_core::errors::{AppError, AppResult, ConflictReason};

use fingergate_config::ConfigError;

/// Folds a configuration failure into the shared error type.
pub fn config_error(err: ConfigError) -> AppError {
    AppError::Config(err.to_string())
}
