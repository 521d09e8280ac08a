//! Error taxonomy
//! Mission: one shared vocabulary of failure for parser, jobs, and API.
//!
//! Five kinds, matching the propagation policy: input errors are the
//! caller's fault and are never retried; parse errors abort a job;
//! resource errors are retried with backoff; invariant violations are
//! logged and always surfaced, never masked. `ParseWarning` is
//! deliberately not a variant here — warnings attach to records and the
//! job continues, so they travel as data (`Vec<ParseWarning>`), not as
//! an error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("input error: {message}")]
    InputError { code: &'static str, message: String },

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("resource error: {0}")]
    ResourceError(#[from] ResourceError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("database unavailable: {0}")]
    Database(String),
    #[error("cache unavailable: {0}")]
    Cache(String),
    #[error("exhausted retries after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::ResourceError(ResourceError::Database(e.to_string()))
    }
}

impl AppError {
    pub fn input(code: &'static str, message: impl Into<String>) -> Self {
        AppError::InputError {
            code,
            message: message.into(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::InputError { code, .. } => code,
            AppError::ParseError(_) => "parse_error",
            AppError::ResourceError(_) => "resource_unavailable",
            AppError::InvariantViolation(_) => "invariant_violation",
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InputError { .. } => StatusCode::BAD_REQUEST,
            AppError::ParseError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ResourceError(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "invariant violation");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(json!(body))).into_response()
    }
}

/// A recoverable anomaly attached to a parsed record. Never aborts a job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ParseWarning {
    pub kind: String,
    pub detail: String,
}

impl ParseWarning {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

/// Retries a fallible resource operation with exponential backoff, capped.
pub async fn retry_with_backoff<F, Fut, T>(
    mut op: F,
    max_attempts: u32,
) -> Result<T, ResourceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, String>>,
{
    let mut attempt = 0;
    let mut delay_ms: u64 = 50;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= max_attempts => {
                return Err(ResourceError::RetriesExhausted {
                    attempts: attempt,
                    last_error: e,
                })
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "resource op failed, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(5_000);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(AppError::NotFound.code(), "not_found");
        assert_eq!(
            AppError::input("bad_request", "oops").code(),
            "bad_request"
        );
    }

    #[tokio::test]
    async fn retry_succeeds_before_exhaustion() {
        let mut calls = 0;
        let result = retry_with_backoff(
            || {
                calls += 1;
                let calls_now = calls;
                async move {
                    if calls_now < 3 {
                        Err("not yet".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
            5,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_exhausts() {
        let result: Result<(), ResourceError> =
            retry_with_backoff(|| async { Err("always fails".to_string()) }, 3).await;
        assert!(matches!(
            result,
            Err(ResourceError::RetriesExhausted { attempts: 3, .. })
        ));
    }
}
