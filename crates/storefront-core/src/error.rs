use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the request pipeline.
///
/// `Clone` so that one failed network call can be handed to every caller
/// that was sharing it through the dedup cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Authentication required - no credential available")]
    Unauthenticated,

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Rate limited - please wait before retrying")]
    Overloaded { retry_after: Option<Duration> },

    #[error("Network error: {0}")]
    NetworkUnavailable(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error: {0}")]
    ServerFault(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Client has been disposed")]
    Disposed,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Pull the backend's own message out of a JSON error body.
    /// The commerce API uses `message`, older endpoints use `error`.
    fn body_message(body: &str) -> String {
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) => value
                .get("message")
                .or_else(|| value.get("error"))
                .and_then(|m| m.as_str())
                .map(Self::truncate_body)
                .unwrap_or_else(|| Self::truncate_body(body)),
            Err(_) => Self::truncate_body(body),
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = Self::body_message(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::Overloaded { retry_after: None },
            500..=599 => ApiError::ServerFault(message),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// Classify a transport-level failure from reqwest.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else {
            ApiError::NetworkUnavailable(err.to_string())
        }
    }

    /// Text suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Unauthenticated | ApiError::Unauthorized => {
                "Authentication failed. Please login again.".to_string()
            }
            ApiError::Overloaded { .. } => {
                "The store is busy right now. Please try again in a moment.".to_string()
            }
            ApiError::NetworkUnavailable(_) => {
                "Network connection failed. Please check your internet connection.".to_string()
            }
            ApiError::Timeout => {
                "Request timed out. Please check your internet connection and try again."
                    .to_string()
            }
            ApiError::ServerFault(_) => "Server error. Please try again later.".to_string(),
            ApiError::NotFound(_) => "Requested resource not found.".to_string(),
            ApiError::AccessDenied(message) | ApiError::InvalidResponse(message) => {
                if message.is_empty() {
                    "Something went wrong. Please try again.".to_string()
                } else {
                    message.clone()
                }
            }
            ApiError::Disposed => "The app is shutting down.".to_string(),
        }
    }

    /// Whether the caller may reasonably re-issue the request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Overloaded { .. }
                | ApiError::NetworkUnavailable(_)
                | ApiError::Timeout
                | ApiError::ServerFault(_)
        )
    }

    /// Whether this failure means the user has to sign in again.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::Unauthenticated | ApiError::Unauthorized)
    }
}
