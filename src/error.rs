//! Error types for the reminder service.
//!
//! Scheduling errors reach the caller of a store operation; persistence errors
//! are absorbed at the adapter boundary and only logged.

use std::path::PathBuf;
use thiserror::Error;

/// The scheduler refused to create or cancel a trigger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("notification permission was denied on the device")]
    PermissionDenied,

    #[error("no more than {limit} triggers may be pending")]
    LimitReached { limit: usize },

    #[error("{hour:02}:{minute:02} is not a valid time of day")]
    InvalidTime { hour: u32, minute: u32 },

    #[error("scheduler is shut down")]
    Shutdown,
}

/// Storage read/write failure.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed record under '{key}': {source}")]
    Malformed {
        key: String,
        #[source]
        source: SnapshotError,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A stored alarm snapshot could not be turned back into a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("invalid time: {0}")]
    InvalidTime(#[from] chrono::ParseError),

    #[error("record has no id")]
    MissingId,
}

/// Pushing a reminder to the device failed.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("APNs request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("APNs rejected the push with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

/// Failure building the APNs provider token.
#[derive(Error, Debug)]
pub enum AuthTokenError {
    #[error("failed to read token key at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("token key is not a valid PEM private key")]
    BadPrivateKey,

    #[error("failed to sign token: {0}")]
    BadSignature(#[from] openssl::error::ErrorStack),
}

/// Settings could not be read from the environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Error returned by `AlarmStore` operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlarmError {
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error("{hour:02}:{minute:02} is not a valid time of day")]
    InvalidTime { hour: u32, minute: u32 },
}
