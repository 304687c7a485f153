// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for orchid-core.
//!
//! One unified error type that maps onto the caller-visible code taxonomy.

use crate::objects::ObjectKind;
use orchid_api::{ApiError, ErrorCode};
use std::fmt;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors produced while processing an action.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Target object id not found in its pool.
    NoExists {
        /// Kind of the missing object.
        kind: ObjectKind,
        /// Id that was looked up.
        oid: i64,
    },

    /// ACL/self-authorization denial, or a quota denial.
    Authorization {
        /// Message naming the object and cause.
        message: String,
    },

    /// Session could not be resolved to a valid, enabled user.
    Authentication {
        /// The reason the session was rejected.
        message: String,
    },

    /// Object locked at or above the requested level.
    Locked {
        /// Kind of the locked object.
        kind: ObjectKind,
        /// Id of the locked object.
        oid: i64,
    },

    /// State-machine or placement precondition not met.
    Action {
        /// Message naming the precondition.
        message: String,
    },

    /// Persistence-layer insert failed.
    Allocate {
        /// Kind of the object being allocated.
        kind: ObjectKind,
        /// Failure detail.
        reason: String,
    },

    /// Invariant violation or unexpected internal failure.
    Internal {
        /// Failure detail.
        message: String,
    },

    /// Consensus-layer write failed. Surfaced but not handled here.
    Replication {
        /// Failure detail.
        message: String,
    },

    /// Database operation failed.
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A driver request failed or timed out.
    Driver {
        /// Failure detail.
        message: String,
    },
}

impl CoreError {
    /// Build an ACTION error from a message.
    pub fn action(message: impl Into<String>) -> Self {
        Self::Action {
            message: message.into(),
        }
    }

    /// Build an AUTHORIZATION error from a message.
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    /// Build an AUTHENTICATION error from a message.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Build an INTERNAL error from a message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The caller-visible error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoExists { .. } => ErrorCode::NoExists,
            Self::Authorization { .. } => ErrorCode::Authorization,
            Self::Authentication { .. } => ErrorCode::Authentication,
            Self::Locked { .. } => ErrorCode::Locked,
            Self::Action { .. } => ErrorCode::Action,
            Self::Allocate { .. } => ErrorCode::Allocate,
            Self::Internal { .. } => ErrorCode::Internal,
            Self::Replication { .. } => ErrorCode::Replication,
            Self::Database { .. } => ErrorCode::Internal,
            Self::Driver { .. } => ErrorCode::Internal,
        }
    }

    /// Convert into the structured API error envelope.
    pub fn to_api_error(&self) -> ApiError {
        ApiError::new(self.code(), self.to_string())
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoExists { kind, oid } => {
                write!(f, "{} [{}] not found", kind, oid)
            }
            Self::Authorization { message } => f.write_str(message),
            Self::Authentication { message } => f.write_str(message),
            Self::Locked { kind, oid } => {
                write!(f, "{} [{}] is locked", kind, oid)
            }
            Self::Action { message } => f.write_str(message),
            Self::Allocate { kind, reason } => {
                write!(f, "Cannot allocate {}: {}", kind, reason)
            }
            Self::Internal { message } => f.write_str(message),
            Self::Replication { message } => {
                write!(f, "Replication failure: {}", message)
            }
            Self::Database { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::Driver { message } => {
                write!(f, "Driver failure: {}", message)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(CoreError, ErrorCode)> = vec![
            (
                CoreError::NoExists {
                    kind: ObjectKind::Vm,
                    oid: 7,
                },
                ErrorCode::NoExists,
            ),
            (
                CoreError::authorization("Not authorized"),
                ErrorCode::Authorization,
            ),
            (
                CoreError::authentication("bad secret"),
                ErrorCode::Authentication,
            ),
            (
                CoreError::Locked {
                    kind: ObjectKind::Image,
                    oid: 3,
                },
                ErrorCode::Locked,
            ),
            (CoreError::action("wrong state"), ErrorCode::Action),
            (
                CoreError::Allocate {
                    kind: ObjectKind::Vm,
                    reason: "insert failed".to_string(),
                },
                ErrorCode::Allocate,
            ),
            (CoreError::internal("oops"), ErrorCode::Internal),
            (
                CoreError::Database {
                    operation: "query".to_string(),
                    details: "closed".to_string(),
                },
                ErrorCode::Internal,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code, "wrong code for {:?}", err);
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn test_display() {
        let err = CoreError::NoExists {
            kind: ObjectKind::Host,
            oid: 12,
        };
        assert_eq!(err.to_string(), "HOST [12] not found");

        let err = CoreError::Locked {
            kind: ObjectKind::Vm,
            oid: 4,
        };
        assert_eq!(err.to_string(), "VM [4] is locked");

        let err = CoreError::Allocate {
            kind: ObjectKind::Image,
            reason: "duplicate row".to_string(),
        };
        assert_eq!(err.to_string(), "Cannot allocate IMAGE: duplicate row");
    }

    #[test]
    fn test_to_api_error() {
        let err = CoreError::action("VM [1] is in state DONE");
        let api = err.to_api_error();
        assert_eq!(api.code, ErrorCode::Action);
        assert_eq!(api.message, "VM [1] is in state DONE");
    }
}
