// crates/sqe-core/src/error.rs
// ============================================================================
// Module: SQE Error Taxonomy
// Description: HTTP-status-bearing domain errors shared by all transports.
// Purpose: Classify every domain failure once, so HTTP and realtime surfaces
//          serialize the identical error object.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Domain failures carry a stable classification, a human-readable message,
//! and an HTTP-status equivalent. HTTP callers map [`ApiError::http_status`]
//! to the response code; realtime callers serialize [`ApiError::envelope`]
//! into the hub payload. Neither transport owns its own translation logic.
//! Transient-communication and circuit-open failures live in the store layer
//! and only convert to [`ApiError::ServerError`] at the outermost boundary.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Taxonomy
// ============================================================================

/// Domain error taxonomy.
///
/// # Invariants
/// - Every variant maps to exactly one HTTP status.
/// - Messages never embed credentials or raw payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Acting user lacks the required read/write/lock/admin capability.
    #[error("forbidden: {message}")]
    Forbidden {
        /// What was denied.
        message: String,
    },
    /// Edition is admin-locked against the acting user.
    #[error("locked: {message}")]
    Locked {
        /// Which edition is locked.
        message: String,
    },
    /// Credentials or token invalid or stale.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Why authentication failed.
        message: String,
    },
    /// Referenced entity or version is absent.
    #[error("not found: {message}")]
    NotFound {
        /// What was missing.
        message: String,
    },
    /// Malformed or rule-violating input.
    #[error("bad input: {message}")]
    BadInput {
        /// What was malformed.
        message: String,
    },
    /// Content collides with an existing unique entity.
    #[error("conflict: {message}")]
    Conflict {
        /// What collided.
        message: String,
    },
    /// System failed to persist data for an unexpected reason.
    #[error("server error: {message}")]
    ServerError {
        /// What failed.
        message: String,
    },
}

impl ApiError {
    /// Returns the HTTP status equivalent of this classification.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Forbidden { .. } => 403,
            Self::Locked { .. } => 423,
            Self::Unauthorized { .. } => 401,
            Self::NotFound { .. } => 404,
            Self::BadInput { .. } => 400,
            Self::Conflict { .. } => 409,
            Self::ServerError { .. } => 500,
        }
    }

    /// Returns a stable classification label.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Forbidden { .. } => "Forbidden",
            Self::Locked { .. } => "Locked",
            Self::Unauthorized { .. } => "Unauthorized",
            Self::NotFound { .. } => "NotFound",
            Self::BadInput { .. } => "BadInput",
            Self::Conflict { .. } => "Conflict",
            Self::ServerError { .. } => "ServerError",
        }
    }

    /// Builds the transport envelope serialized to realtime clients.
    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            exception_type: self.error_type().to_string(),
            message: self.to_string(),
            custom_data: None,
        }
    }
}

// ============================================================================
// SECTION: Transport Envelope
// ============================================================================

/// Serialized error payload shared by HTTP bodies and realtime hub
/// exceptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// Stable classification label.
    pub exception_type: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<serde_json::Value>,
}
