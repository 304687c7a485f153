// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller-visible error codes and the API error envelope.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for API-level calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error codes surfaced to callers.
///
/// Every failed operation maps to exactly one of these. The code is stable
/// vocabulary; the accompanying message is free text naming the object and
/// cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The operation completed.
    Success,
    /// ACL/self-authorization or quota denial.
    Authorization,
    /// Session could not be resolved to a valid user.
    Authentication,
    /// State-machine or placement precondition not met.
    Action,
    /// Persistence-layer insert failed.
    Allocate,
    /// Target object id not found in its pool.
    NoExists,
    /// Object locked at or above the requested level.
    Locked,
    /// Invariant violation or unexpected internal failure.
    Internal,
    /// Consensus-layer write failed.
    Replication,
    /// Malformed call at the RPC surface.
    RpcApi,
}

impl ErrorCode {
    /// Stable string form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Authorization => "AUTHORIZATION",
            Self::Authentication => "AUTHENTICATION",
            Self::Action => "ACTION",
            Self::Allocate => "ALLOCATE",
            Self::NoExists => "NO_EXISTS",
            Self::Locked => "LOCKED",
            Self::Internal => "INTERNAL",
            Self::Replication => "REPLICATION",
            Self::RpcApi => "RPC_API",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured failure response: one code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// The error code.
    pub code: ErrorCode,
    /// Human-readable message naming the failing object and cause.
    pub message: String,
}

impl ApiError {
    /// Build an error from a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}
