use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use image::ImageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::IdentityRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    Name,
    Fingerprint,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::Name => f.write_str("name already registered"),
            ConflictReason::Fingerprint => f.write_str("fingerprint already registered"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{reason} as '{}' (id {})", existing.name, existing.id)]
    Conflict {
        reason: ConflictReason,
        existing: IdentityRef,
    },

    #[error("enrollment timed out after {captured} of {required} captures")]
    Timeout { captured: usize, required: usize },

    #[error("template merge failed (code {code})")]
    MergeFailed { code: i32 },

    #[error("sensor {operation} failed (code {code})")]
    Device { operation: &'static str, code: i32 },

    #[error("sensor unavailable: {0}")]
    DeviceLost(String),

    #[error("sensor is in use: {0}")]
    SensorInUse(String),

    #[error("fingerprint service is not initialized")]
    NotInitialized,

    #[error("an enrollment is already in progress")]
    Busy,

    #[error("no identity with id {id}")]
    NotFound { id: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to read identity store {path}: {source}")]
    StoreRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write identity store {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("identity store {path} is invalid: {message}")]
    InvalidStore { path: PathBuf, message: String },

    #[error("failed to write capture image {path}: {source}")]
    CaptureWrite {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error("capture buffer of {actual} bytes does not match {width}x{height} image")]
    CaptureGeometry {
        width: u32,
        height: u32,
        actual: usize,
    },

    #[error("webhook delivery failed: {0}")]
    Webhook(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no fingergate service is listening on {}", path.display())]
    NotServing { path: PathBuf },

    #[error("{message}")]
    Remote { message: String, status: u8 },
}

impl AppError {
    /// Process exit status for this error.
    pub fn exit_status(&self) -> u8 {
        match self {
            AppError::InvalidInput(_) => 2,
            AppError::Config(_) => 2,
            AppError::InvalidStore { .. } => 2,
            AppError::MergeFailed { .. } => 3,
            AppError::Device { .. } => 3,
            AppError::SensorInUse(_) => 3,
            AppError::DeviceLost(_) => 4,
            AppError::NotInitialized => 4,
            AppError::NotFound { .. } => 4,
            AppError::NotServing { .. } => 4,
            AppError::Conflict { .. } => 5,
            AppError::Timeout { .. } => 6,
            AppError::Busy => 7,
            AppError::Remote { status, .. } => *status,
            _ => 1,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }

    pub fn human_message(&self) -> String {
        self.to_string()
    }

    /// Identity that blocked an enrollment or import, if any.
    pub fn conflict(&self) -> Option<(ConflictReason, &IdentityRef)> {
        match self {
            AppError::Conflict { reason, existing } => Some((*reason, existing)),
            _ => None,
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, AppError::DeviceLost(_))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_exposes_existing_identity() {
        let err = AppError::Conflict {
            reason: ConflictReason::Fingerprint,
            existing: IdentityRef {
                id: "abc".into(),
                name: "Alice".into(),
            },
        };
        let (reason, existing) = err.conflict().expect("conflict expected");
        assert_eq!(reason, ConflictReason::Fingerprint);
        assert_eq!(existing.name, "Alice");
        assert_eq!(
            err.to_string(),
            "fingerprint already registered as 'Alice' (id abc)"
        );
    }

    #[test]
    fn timeout_reports_partial_count() {
        let err = AppError::Timeout {
            captured: 2,
            required: 3,
        };
        assert!(err.conflict().is_none());
        assert_eq!(err.exit_code(), ExitCode::from(6));
        assert!(err.to_string().contains("2 of 3"));
    }

    #[test]
    fn remote_errors_keep_their_status() {
        let err = AppError::Remote {
            message: "sensor merge failed".into(),
            status: 3,
        };
        assert_eq!(err.exit_status(), 3);
        assert_eq!(err.to_string(), "sensor merge failed");
        assert_eq!(AppError::SensorInUse("spool".into()).exit_status(), 3);
    }
}
