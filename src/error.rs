use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Error type shared by every service in the crate.
///
/// Variants map 1:1 onto the error codes exposed at the API boundary;
/// see [`ScreenshotError::error_code`] and [`ScreenshotError::http_status`].
#[derive(Debug, Clone, Error)]
pub enum ScreenshotError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Browser pool exhausted: {in_use}/{pool_size} in use after {wait_attempts} wait attempts")]
    PoolExhausted {
        pool_size: usize,
        in_use: usize,
        wait_attempts: usize,
    },

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request rejected, queue full")]
    QueueFull,

    #[error("Circuit breaker '{name}' is open, retry in {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("Operation '{operation}' failed after {retries} retries: {cause}")]
    RetriesExhausted {
        operation: String,
        retries: usize,
        cause: String,
    },

    #[error("Tab not available: {0}")]
    TabUnavailable(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScreenshotError {
    /// Stable error code for the HTTP layer's `{error_code, message}` envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            ScreenshotError::InvalidInput(_) => "validation_error",
            ScreenshotError::PoolExhausted { .. } => "system_overloaded",
            ScreenshotError::QueueFull => "system_overloaded",
            ScreenshotError::RateLimited(_) => "rate_limited",
            ScreenshotError::Browser(_) | ScreenshotError::BrowserLaunchFailed(_) => "browser_error",
            ScreenshotError::Navigation { .. } => "navigation_error",
            ScreenshotError::CaptureFailed(_) => "screenshot_error",
            ScreenshotError::Storage(_) => "storage_error",
            ScreenshotError::Upload(_) => "upload_error",
            ScreenshotError::CircuitOpen { .. } => "circuit_breaker_open",
            ScreenshotError::RetriesExhausted { .. } => "max_retries_exceeded",
            ScreenshotError::TabUnavailable(_) => "system_overloaded",
            ScreenshotError::Timeout(_) => "navigation_error",
            ScreenshotError::Io(_)
            | ScreenshotError::Serialization(_)
            | ScreenshotError::Internal(_) => "internal",
        }
    }

    /// HTTP status the API layer should map this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            ScreenshotError::InvalidInput(_) => 400,
            ScreenshotError::Navigation { .. }
            | ScreenshotError::CaptureFailed(_)
            | ScreenshotError::Timeout(_) => 422,
            ScreenshotError::PoolExhausted { .. }
            | ScreenshotError::QueueFull
            | ScreenshotError::RateLimited(_)
            | ScreenshotError::TabUnavailable(_) => 429,
            ScreenshotError::CircuitOpen { .. } | ScreenshotError::RetriesExhausted { .. } => 503,
            _ => 500,
        }
    }
}

/// How the retry engine should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Never retried.
    Permanent,
    /// Always retried (up to the configured limit).
    Transient,
    /// Retried while the conservative unknown-error budget allows.
    Unknown,
}

/// Message fragments that mark an otherwise-unclassified error as transient.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "connection refused",
    "connection reset",
    "temporary failure",
    "resource temporarily unavailable",
    "browser context",
    "page closed",
    "target closed",
];

/// Classify an error for the retry engine.
///
/// Classification order matters: permanent kinds short-circuit before the
/// transient kinds, and message-pattern matching only applies to errors
/// that fall through both.
pub fn classify(error: &ScreenshotError) -> ErrorClass {
    match error {
        ScreenshotError::InvalidInput(_) | ScreenshotError::Serialization(_) => {
            ErrorClass::Permanent
        }
        ScreenshotError::Io(msg) => {
            let lower = msg.to_lowercase();
            if lower.contains("permission denied") || lower.contains("not found") {
                ErrorClass::Permanent
            } else {
                ErrorClass::Unknown
            }
        }
        ScreenshotError::Timeout(_) => ErrorClass::Transient,
        ScreenshotError::Navigation { reason, .. } => {
            let lower = reason.to_lowercase();
            if lower.contains("timeout") || matches_transient(&lower) {
                ErrorClass::Transient
            } else {
                ErrorClass::Unknown
            }
        }
        ScreenshotError::Browser(msg)
        | ScreenshotError::CaptureFailed(msg)
        | ScreenshotError::Internal(msg) => {
            if matches_transient(&msg.to_lowercase()) {
                ErrorClass::Transient
            } else {
                ErrorClass::Unknown
            }
        }
        ScreenshotError::PoolExhausted { .. } | ScreenshotError::TabUnavailable(_) => {
            ErrorClass::Transient
        }
        _ => ErrorClass::Unknown,
    }
}

fn matches_transient(lower: &str) -> bool {
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

impl From<AcquireError> for ScreenshotError {
    fn from(err: AcquireError) -> Self {
        ScreenshotError::Internal(format!("semaphore closed: {err}"))
    }
}

impl From<std::io::Error> for ScreenshotError {
    fn from(err: std::io::Error) -> Self {
        ScreenshotError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ScreenshotError {
    fn from(err: serde_json::Error) -> Self {
        ScreenshotError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_api_contract() {
        assert_eq!(
            ScreenshotError::InvalidInput("w".into()).error_code(),
            "validation_error"
        );
        assert_eq!(
            ScreenshotError::CircuitOpen {
                name: "nav".into(),
                retry_after: Duration::from_secs(3),
            }
            .error_code(),
            "circuit_breaker_open"
        );
        assert_eq!(
            ScreenshotError::PoolExhausted {
                pool_size: 4,
                in_use: 4,
                wait_attempts: 10,
            }
            .http_status(),
            429
        );
        assert_eq!(
            ScreenshotError::RetriesExhausted {
                operation: "navigate".into(),
                retries: 3,
                cause: "timeout".into(),
            }
            .http_status(),
            503
        );
    }

    #[test]
    fn classification_follows_precedence() {
        assert_eq!(
            classify(&ScreenshotError::InvalidInput("bad width".into())),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify(&ScreenshotError::Timeout(Duration::from_secs(30))),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ScreenshotError::Browser("Target closed".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ScreenshotError::Browser("connection reset by peer".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ScreenshotError::Browser("unexpected CDP message".into())),
            ErrorClass::Unknown
        );
        assert_eq!(
            classify(&ScreenshotError::Io("permission denied".into())),
            ErrorClass::Permanent
        );
    }
}
