use crate::models::{CrawlError, CrawlErrorCode};

/// Categorize a session failure from its message.
pub fn classify_error(message: &str) -> CrawlErrorCode {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timeout") {
        CrawlErrorCode::Timeout
    } else if lower.contains("net::err") || lower.contains("navigation") || lower.contains("goto")
    {
        CrawlErrorCode::Navigation
    } else {
        CrawlErrorCode::Unknown
    }
}

impl CrawlError {
    pub fn new(code: CrawlErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build an error whose code is inferred from the message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code: classify_error(&message),
            message,
        }
    }
}

impl std::fmt::Display for CrawlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}
