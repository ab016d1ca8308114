//! Error types for hub access

use thiserror::Error;

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Errors talking to the hub
#[derive(Debug, Error)]
pub enum HubError {
    /// Transport-level HTTP failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The hub answered with a non-success status
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    /// WebSocket connect or transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The hub rejected the access token
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A message did not have the expected shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A command result reported failure
    #[error("command '{command}' failed: {message}")]
    Command { command: String, message: String },

    /// No answer within the deadline
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// JSON encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// Whether the failure is worth retrying later
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::WebSocket(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
