//! Error taxonomy and classification for the AI backend layer

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified failure categories shared by the factory, monitor and
/// report-generation fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Authentication,
    Authorization,
    QuotaExceeded,
    ValidationError,
    InitializationError,
    ServiceError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::InitializationError => "initialization_error",
            ErrorKind::ServiceError => "service_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed errors raised at the backend-client boundary.
///
/// Client implementations are expected to surface these variants directly so
/// classification never has to re-derive the category from message text.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("authorization denied: {0}")]
    Authorization(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("service error: {0}")]
    Service(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Timeout(_) => ErrorKind::Timeout,
            BackendError::Authentication(_) => ErrorKind::Authentication,
            BackendError::Authorization(_) => ErrorKind::Authorization,
            BackendError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            BackendError::Validation(_) => ErrorKind::ValidationError,
            BackendError::Initialization(_) => ErrorKind::InitializationError,
            BackendError::Service(_) => ErrorKind::ServiceError,
        }
    }
}

/// Classify an error into the taxonomy.
///
/// Typed [`BackendError`] values are mapped through their variant; keyword
/// matching over the rendered message is kept only as a last resort for
/// opaque errors from third-party code.
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    if let Some(backend) = error.downcast_ref::<BackendError>() {
        return backend.kind();
    }
    classify_message(&error.to_string())
}

/// Keyword-based fallback classification. Best effort, not a guarantee.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("invalid credentials")
        || lower.contains("api key")
        || lower.contains("access key")
    {
        ErrorKind::Authentication
    } else if lower.contains("forbidden")
        || lower.contains("access denied")
        || lower.contains("not authorized")
    {
        ErrorKind::Authorization
    } else if lower.contains("quota")
        || lower.contains("rate limit")
        || lower.contains("throttl")
        || lower.contains("too many requests")
    {
        ErrorKind::QuotaExceeded
    } else if lower.contains("validation")
        || lower.contains("invalid request")
        || lower.contains("malformed")
    {
        ErrorKind::ValidationError
    } else if lower.contains("initializ") {
        ErrorKind::InitializationError
    } else {
        ErrorKind::ServiceError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_keyword_classification() {
        assert_eq!(classify_message("request timed out after 30s"), ErrorKind::Timeout);
        assert_eq!(classify_message("401 Unauthorized"), ErrorKind::Authentication);
        assert_eq!(classify_message("access denied for role"), ErrorKind::Authorization);
        assert_eq!(classify_message("ThrottlingException: slow down"), ErrorKind::QuotaExceeded);
        assert_eq!(classify_message("validation failed on field"), ErrorKind::ValidationError);
        assert_eq!(classify_message("initialization aborted"), ErrorKind::InitializationError);
        assert_eq!(classify_message("boom"), ErrorKind::ServiceError);
    }

    #[test]
    fn test_typed_classification_wins_over_message_text() {
        // Message mentions a timeout, but the typed variant is authoritative.
        let err = anyhow::Error::new(BackendError::Authentication(
            "token refresh timed out".to_string(),
        ));
        assert_eq!(classify_error(&err), ErrorKind::Authentication);
    }

    #[test]
    fn test_opaque_errors_fall_back_to_keywords() {
        let err = anyhow!("connection timed out");
        assert_eq!(classify_error(&err), ErrorKind::Timeout);
    }
}
