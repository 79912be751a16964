use crate::error::Error;

/// Actionable classification of model backend errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Authentication failure (HTTP 401/403).
    Auth,
    /// Rate limited (HTTP 429).
    RateLimited,
    /// The conversation exceeds the model's context window. Must never be
    /// retried verbatim.
    ContextTooLong,
    /// Network-level failure reaching the provider.
    Connection,
    /// Anything else.
    Generic,
}

impl ErrorClass {
    /// Human-readable recovery hint surfaced alongside the failure.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            Self::Auth => "check the configured API key and provider credentials",
            Self::RateLimited => "wait and resend, or lower the request rate",
            Self::ContextTooLong => {
                "compact the conversation, clear the history, or switch to a \
                 model with a larger context window"
            }
            Self::Connection => "check network connectivity to the provider endpoint",
            Self::Generic => "inspect the provider diagnostic message",
        }
    }
}

/// Classify an [`Error`] into an actionable [`ErrorClass`].
pub fn classify(error: &Error) -> ErrorClass {
    match error {
        Error::Api { status, message, .. } => classify_api(*status, message),
        Error::Http(e) => {
            if e.is_connect() || e.is_timeout() {
                ErrorClass::Connection
            } else {
                ErrorClass::Generic
            }
        }
        _ => ErrorClass::Generic,
    }
}

fn classify_api(status: u16, message: &str) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::Auth,
        429 => ErrorClass::RateLimited,
        400 | 413 => {
            if is_context_overflow(message) {
                ErrorClass::ContextTooLong
            } else {
                ErrorClass::Generic
            }
        }
        _ => ErrorClass::Generic,
    }
}

/// Check if an error message indicates context overflow.
///
/// Uses case-insensitive substring matching (no regex dependency).
fn is_context_overflow(message: &str) -> bool {
    const PATTERNS: &[&str] = &[
        "prompt is too long",
        "maximum context length",
        "context_length_exceeded",
        "context window",
        "too many tokens",
        "input is too long",
        "exceeds the model's maximum context",
        "request too large",
    ];

    let lower = message.to_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}
