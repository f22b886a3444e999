//! Error types for the Chain Push Relay
//!
//! Provides structured error types for the event-stream client, the
//! subscription registry, snapshot persistence and notification delivery.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Event stream transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    #[error("Event stream gave up after {attempts} reconnect attempts")]
    StreamExhausted { attempts: u32 },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Validation failed ({code}): {message}")]
    Validation { code: String, message: String },

    #[error("Subscription not found: {device_token}")]
    SubscriptionNotFound { device_token: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Snapshot persistence failed: {0}")]
    Persistence(String),

    #[error("Snapshot at {path} could not be decoded: {reason}")]
    SnapshotDecode { path: String, reason: String },

    // =========================================================================
    // Delivery Errors
    // =========================================================================
    #[error("Push delivery failed: {0}")]
    Delivery(String),

    #[error("Push provider did not answer within {0:?}")]
    ProviderTimeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse failure class used for logging and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Event-stream disconnects and socket errors
    Transport,
    /// Malformed requests rejected at the boundary
    Validation,
    /// Snapshot read/write failures
    Persistence,
    /// Provider rejections and delivery failures
    Delivery,
    /// Everything else
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Persistence => write!(f, "persistence"),
            ErrorCategory::Delivery => write!(f, "delivery"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Build a validation error with a machine-readable code
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Map this error onto the failure taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Transport(_)
            | Error::WebSocket(_)
            | Error::ConnectTimeout { .. }
            | Error::StreamExhausted { .. } => ErrorCategory::Transport,

            Error::Validation { .. } | Error::SubscriptionNotFound { .. } => {
                ErrorCategory::Validation
            }

            Error::Persistence(_) | Error::SnapshotDecode { .. } | Error::Io(_) => {
                ErrorCategory::Persistence
            }

            Error::Delivery(_) | Error::ProviderTimeout(_) | Error::Http(_) => {
                ErrorCategory::Delivery
            }

            Error::Internal(_) | Error::Configuration(_) | Error::JsonParse(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Check if retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::StreamExhausted { .. } | Error::SnapshotDecode { .. } => false,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            other => matches!(
                other.category(),
                ErrorCategory::Transport | ErrorCategory::Persistence
            ) || matches!(other, Error::ProviderTimeout(_)),
        }
    }

    /// Machine-readable code reported to API clients
    pub fn code(&self) -> &str {
        match self {
            Error::Validation { code, .. } => code,
            Error::SubscriptionNotFound { .. } => "not_found",
            _ => match self.category() {
                ErrorCategory::Transport => "transport_error",
                ErrorCategory::Persistence => "persistence_error",
                ErrorCategory::Delivery => "delivery_error",
                _ => "internal_error",
            },
        }
    }
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;
