use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable classification shared by API responses and stored job failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    StoreUnavailable,
    JobRaised,
    MaxAttemptsExceeded,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::JobRaised => "JobRaised",
            ErrorKind::MaxAttemptsExceeded => "MaxAttemptsExceeded",
            ErrorKind::NotFound => "NotFound",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection loss, pool exhaustion, serialization conflicts. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected, admin/crash shutdown
                Some("40001") | Some("40P01") | Some("57P01") | Some("57P02") | Some("57P03") => {
                    StoreError::Unavailable(err.to_string())
                }
                _ => StoreError::Backend(err.to_string()),
            },
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("payload is {size} bytes, limit is {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job {0} not found or expired")]
    NotFound(Uuid),

    #[error("lease on job {0} is no longer held by this worker")]
    LeaseLost(Uuid),

    #[error("corrupt record at {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::PayloadTooLarge { .. } => ErrorKind::ValidationError,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Store(e) if e.is_transient() => ErrorKind::StoreUnavailable,
            // A lost lease is resolved by the reaper; callers see it as a store-side condition.
            Error::Store(_) | Error::LeaseLost(_) | Error::Codec { .. } => {
                ErrorKind::StoreUnavailable
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_transient())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_onto_the_public_classification() {
        assert_eq!(
            Error::validation("empty payload").kind(),
            ErrorKind::ValidationError
        );
        assert_eq!(Error::NotFound(Uuid::nil()).kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::PayloadTooLarge { size: 10, max: 5 }.kind(),
            ErrorKind::ValidationError
        );
        assert_eq!(
            Error::from(StoreError::Unavailable("conn reset".into())).kind(),
            ErrorKind::StoreUnavailable
        );
        assert!(Error::from(StoreError::Unavailable("x".into())).is_transient());
        assert!(!Error::from(StoreError::Backend("x".into())).is_transient());
    }

    #[test]
    fn kind_serializes_as_its_name() {
        let v = serde_json::to_value(ErrorKind::JobRaised).unwrap();
        assert_eq!(v, serde_json::json!("JobRaised"));
        assert_eq!(ErrorKind::MaxAttemptsExceeded.as_str(), "MaxAttemptsExceeded");
    }
}
