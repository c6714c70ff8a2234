//! Service-wide error taxonomy.
//!
//! Every component tags its failures with a [`Kind`]; the coordinator re-tags
//! only where the domain meaning changes, and the API layer maps kinds
//! one-to-one onto HTTP statuses.

use std::fmt;
use thiserror::Error;

/// Failure classification shared by all components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Unknown,
    Internal,
    InvalidArgument,
    Unauthenticated,
    Conflict,
    NotFound,
    Canceled,
    DeadlineExceeded,
    PermissionDenied,
}

impl Kind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Internal => "INTERNAL",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Conflict => "CONFLICT",
            Self::NotFound => "NOT_FOUND",
            Self::Canceled => "CANCELED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::PermissionDenied => "PERMISSION_DENIED",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    pub kind: Kind,
    pub message: String,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Kind::Internal, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidArgument, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Kind::Unauthenticated, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Kind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Kind::NotFound, message)
    }

    /// Re-tag this error, keeping the original message.
    #[must_use]
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found("row not found"),
            sqlx::Error::PoolTimedOut => {
                Self::new(Kind::DeadlineExceeded, "database pool timed out")
            }
            other => Self::internal(format!("database error: {other}")),
        }
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::new(Kind::DeadlineExceeded, format!("store timed out: {err}"))
        } else {
            Self::internal(format!("store error: {err}"))
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization error: {err}"))
    }
}

impl From<bcrypt::BcryptError> for ServiceError {
    fn from(err: bcrypt::BcryptError) -> Self {
        Self::internal(format!("password hashing error: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for ServiceError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::new(Kind::DeadlineExceeded, "deadline exceeded")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(Kind::Internal.as_str(), "INTERNAL");
        assert_eq!(Kind::InvalidArgument.as_str(), "INVALID_ARGUMENT");
        assert_eq!(Kind::DeadlineExceeded.as_str(), "DEADLINE_EXCEEDED");
        assert_eq!(Kind::PermissionDenied.as_str(), "PERMISSION_DENIED");
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = ServiceError::conflict("email already registered");
        assert_eq!(err.to_string(), "CONFLICT: email already registered");
    }

    #[test]
    fn with_kind_retags_without_losing_message() {
        let err = ServiceError::not_found("no row").with_kind(Kind::Unauthenticated);
        assert_eq!(err.kind, Kind::Unauthenticated);
        assert_eq!(err.message, "no row");
    }

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        let err = ServiceError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.kind, Kind::NotFound);
    }

    #[test]
    fn sqlx_pool_timeout_maps_to_deadline() {
        let err = ServiceError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind, Kind::DeadlineExceeded);
    }
}
