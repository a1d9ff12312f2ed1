//! Error taxonomy
//!
//! Every failure surfaced by the library is an [`Error`]. Callers that need to
//! decide whether to retry, re-read, or give up should look at [`Error::kind`]
//! rather than matching on messages.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification driving retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or conflicting configuration. Never retried.
    Validation,
    /// Credential parse failure or token minting denied.
    Authentication,
    /// Network failures, 429 and 5xx. Retried with backoff by the dispatcher.
    Transient,
    /// Stale etag (409/412). Retried by re-reading, never by resending.
    Conflict,
    /// Everything else, including quota/permission 4xx and exhausted budgets.
    Fatal,
    /// The caller cancelled or its deadline passed.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value for \"{field}\": {message}")]
    Validation { field: String, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to parse response JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("{operation} on {target} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        operation: String,
        target: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("batched request failed: {0}")]
    BatchFailed(#[source] Arc<Error>),

    #[error("change to {0} was written but did not become visible in time")]
    NotPropagated(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a validation error naming the offending field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn authentication(message: impl std::fmt::Display) -> Self {
        Error::Authentication(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Api(api) => api.kind(),
            Error::Network(_) | Error::Timeout(_) => ErrorKind::Transient,
            Error::Decode(_) | Error::Internal(_) | Error::NotPropagated(_) => ErrorKind::Fatal,
            Error::Cancelled | Error::DeadlineExceeded => ErrorKind::Cancelled,
            Error::Exhausted { source, .. } => match source.kind() {
                ErrorKind::Cancelled => ErrorKind::Cancelled,
                ErrorKind::Authentication => ErrorKind::Authentication,
                _ => ErrorKind::Fatal,
            },
            Error::BatchFailed(inner) => inner.kind(),
        }
    }

    /// The HTTP status behind this error, if it came from the API.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api(api) => Some(api.status),
            Error::Exhausted { source, .. } => source.status(),
            Error::BatchFailed(inner) => inner.status(),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// A non-2xx response from a Google API.
#[derive(Debug, Clone, thiserror::Error)]
#[error("googleapi: Error {status}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
    /// The canonical status string, e.g. `PERMISSION_DENIED`.
    pub code: Option<String>,
    /// Reasons from `error.errors[].reason` and `error.details[].reason`.
    pub reasons: Vec<String>,
    pub body: String,
}

#[derive(Deserialize)]
struct Envelope {
    error: EnvelopeError,
}

#[derive(Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    errors: Vec<EnvelopeReason>,
    #[serde(default)]
    details: Vec<EnvelopeReason>,
}

#[derive(Deserialize)]
struct EnvelopeReason {
    #[serde(default)]
    reason: Option<String>,
}

impl ApiError {
    /// Parse the standard `{"error": {...}}` envelope, falling back to the raw
    /// body as the message when the server sent something else.
    pub fn from_response(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match serde_json::from_str::<Envelope>(&body) {
            Ok(envelope) => {
                let err = envelope.error;
                let reasons = err
                    .errors
                    .into_iter()
                    .chain(err.details)
                    .filter_map(|r| r.reason)
                    .collect();
                let message = if err.message.is_empty() {
                    default_message(status)
                } else {
                    err.message
                };
                Self {
                    status,
                    message,
                    code: err.status,
                    reasons,
                    body,
                }
            }
            Err(_) => Self {
                status,
                message: if body.trim().is_empty() {
                    default_message(status)
                } else {
                    body.trim().to_string()
                },
                code: None,
                reasons: Vec::new(),
                body,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.status {
            409 if self.body.contains("operationInProgress") => ErrorKind::Transient,
            409 | 412 => ErrorKind::Conflict,
            403 if self.is_quota_per_minute() => ErrorKind::Transient,
            429 => ErrorKind::Transient,
            s if s >= 500 => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }

    /// Per-minute quota exhaustion refreshes on its own; other 403s need an
    /// operator.
    fn is_quota_per_minute(&self) -> bool {
        self.body.contains("Quota exceeded for quota metric")
            && self.body.contains(" per minute' of service")
    }
}

fn default_message(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unknown error")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, body: &str) -> Error {
        Error::Api(ApiError::from_response(status, body))
    }

    #[test]
    fn test_parses_error_envelope() {
        let err = ApiError::from_response(
            403,
            r#"{"error":{"code":403,"message":"Permission denied","status":"PERMISSION_DENIED",
                "errors":[{"reason":"forbidden"}],
                "details":[{"@type":"type.googleapis.com/google.rpc.ErrorInfo","reason":"SERVICE_DISABLED"}]}}"#,
        );
        assert_eq!(err.message, "Permission denied");
        assert_eq!(err.code.as_deref(), Some("PERMISSION_DENIED"));
        assert_eq!(err.reasons, vec!["forbidden", "SERVICE_DISABLED"]);
        assert_eq!(err.to_string(), "googleapi: Error 403: Permission denied");
    }

    #[test]
    fn test_non_json_body_becomes_message() {
        let err = ApiError::from_response(502, "<html>bad gateway</html>");
        assert_eq!(err.message, "<html>bad gateway</html>");
        let err = ApiError::from_response(404, "");
        assert_eq!(err.message, "Not Found");
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(api(429, "").kind(), ErrorKind::Transient);
        assert_eq!(api(500, "").kind(), ErrorKind::Transient);
        assert_eq!(api(503, "").kind(), ErrorKind::Transient);
        assert_eq!(api(409, "").kind(), ErrorKind::Conflict);
        assert_eq!(api(412, "").kind(), ErrorKind::Conflict);
        assert_eq!(api(400, "").kind(), ErrorKind::Fatal);
        assert_eq!(api(403, "").kind(), ErrorKind::Fatal);
        assert_eq!(api(404, "").kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_operation_in_progress_is_transient() {
        let err = api(
            409,
            r#"{"error":{"message":"busy","errors":[{"reason":"operationInProgress"}]}}"#,
        );
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_quota_per_minute_is_transient() {
        let body = "Quota exceeded for quota metric 'Read requests' and limit \
                    'Read requests per minute' of service 'compute.googleapis.com'";
        assert_eq!(api(403, body).kind(), ErrorKind::Transient);
        let daily = "Quota exceeded for quota metric 'Read requests' and limit \
                     'Read requests per day' of service 'compute.googleapis.com'";
        assert_eq!(api(403, daily).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_exhausted_wraps_and_reclassifies() {
        let err = Error::Exhausted {
            operation: "setIamPolicy".into(),
            target: "projects/p".into(),
            attempts: 3,
            source: Box::new(api(409, "")),
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(err.status(), Some(409));
        assert!(err.to_string().contains("setIamPolicy on projects/p failed after 3 attempt(s)"));

        let cancelled = Error::Exhausted {
            operation: "get".into(),
            target: "x".into(),
            attempts: 1,
            source: Box::new(Error::Cancelled),
        };
        assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_batch_failure_keeps_cause_kind() {
        let err = Error::BatchFailed(Arc::new(api(503, "")));
        assert!(err.is_transient());
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn test_validation_message_names_field() {
        let err = Error::validation("project", "expected a non-empty string");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            err.to_string(),
            "invalid value for \"project\": expected a non-empty string"
        );
    }
}
