//! Error types for snapshot split planning and assignment
//!
//! Includes error classification for retry decisions and alerting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error classes for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Source catalog errors (statistics, sampling, shard metadata)
    Catalog,
    /// Schema capture errors
    Schema,
    /// Planning exhausted its retries or produced invalid splits
    Planning,
    /// Invalid split or coordinator settings
    Configuration,
    /// Source unreachable or slow
    Network,
    /// Coordinator/actor lifecycle errors
    Coordinator,
    /// Serialization errors (checkpoint JSON)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Snapshot split errors
#[derive(Error, Debug)]
pub enum SplitError {
    /// Statistics, sample or shard metadata could not be fetched
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Structural schema could not be captured
    #[error("Schema error: {0}")]
    Schema(String),

    /// Planning for one collection gave up after retrying
    #[error("Planning failed for {collection} after {attempts} attempt(s): {reason}")]
    PlanningFailed {
        collection: String,
        attempts: u32,
        reason: String,
    },

    /// A strategy produced overlapping or gapped bounds
    #[error("Invariant violation for {collection}: {reason}")]
    InvariantViolation { collection: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection to the source closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// The assigner actor is no longer running
    #[error("Assigner closed")]
    AssignerClosed,

    /// Operation not allowed in the assigner's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Checkpoint (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SplitError {
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Bounds of `collection` do not tile its key domain
    pub fn invariant(collection: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            collection: collection.to_string(),
            reason: reason.into(),
        }
    }

    pub fn planning_failed(collection: impl ToString, attempts: u32, reason: impl ToString) -> Self {
        Self::PlanningFailed {
            collection: collection.to_string(),
            attempts,
            reason: reason.to_string(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether a planning call failing with this error is worth repeating.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Timeout(_) => true,

            // Catalog and schema endpoints report transient failures in-band
            Self::Catalog(msg) | Self::Schema(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("temporarily")
                    || msg.contains("unavailable")
                    || msg.contains("connection reset")
                    || msg.contains("timed out")
            }

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::PlanningFailed { .. }
            | Self::InvariantViolation { .. }
            | Self::Config(_)
            | Self::AssignerClosed
            | Self::InvalidState(_)
            | Self::Json(_)
            | Self::Other(_) => false,
        }
    }

    /// Category used as a metric label.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Catalog(_) => ErrorCategory::Catalog,
            Self::Schema(_) => ErrorCategory::Schema,
            Self::PlanningFailed { .. } => ErrorCategory::Planning,
            Self::InvariantViolation { .. } => ErrorCategory::Planning,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Timeout(_) => ErrorCategory::Network,
            Self::ConnectionClosed => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Network,
            Self::AssignerClosed => ErrorCategory::Coordinator,
            Self::InvalidState(_) => ErrorCategory::Coordinator,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Stable snake_case code for logs and metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Catalog(_) => "catalog_error",
            Self::Schema(_) => "schema_error",
            Self::PlanningFailed { .. } => "planning_failed",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::Config(_) => "config_error",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::AssignerClosed => "assigner_closed",
            Self::InvalidState(_) => "invalid_state",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for split operations
pub type Result<T> = std::result::Result<T, SplitError>;
