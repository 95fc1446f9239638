//! Error taxonomy for the gateway.
//!
//! Internal components return [`Error`] and never stringify a code themselves;
//! the HTTP status mapping lives entirely in the `IntoResponse` impl below so
//! that the gateway edge is the only place translating domain errors to wire
//! status codes.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed tagged-variant error enum, one family per documented taxonomy entry.
#[derive(Error, Debug)]
pub enum Error {
    /// No, expired, or otherwise invalid bearer token.
    #[error("authentication required: {0}")]
    Unauthenticated(String),

    /// Caller is authenticated but lacks the required role/permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Login failed; deliberately indistinguishable from `UserNotFound`.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Caller's account exists but is not active.
    #[error("account disabled")]
    AccountDisabled,

    /// A rate-limit scope denied admission.
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited {
        /// Which scope denied the request (global/ip/user/endpoint).
        scope: String,
        /// Seconds until the caller may retry.
        retry_after_secs: u64,
    },

    /// Requested resource does not exist (or is not visible to the caller).
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or semantically invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Upstream responded with a non-2xx status.
    #[error("downstream error: {0}")]
    DownstreamError(String),

    /// Upstream connection could not be established.
    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    /// Upstream call exceeded its deadline.
    #[error("downstream timeout: {0}")]
    DownstreamTimeout(String),

    /// Anything else; never exposes internals to the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The stable 4-digit code carried in the error envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "1001",
            Self::RateLimited { .. } => "1005",
            Self::Unauthenticated(_) => "2001",
            Self::Forbidden(_) => "2002",
            Self::InvalidCredentials | Self::AccountDisabled => "3004",
            Self::NotFound(_) => "3001",
            Self::DownstreamTimeout(_) => "4003",
            Self::DownstreamError(_) => "5003",
            Self::DownstreamUnavailable(_) => "5004",
            Self::Internal(_) => "5000",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidCredentials | Self::AccountDisabled => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DownstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::DownstreamError(_) => StatusCode::BAD_GATEWAY,
            Self::DownstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message exposed externally. `InvalidCredentials`/`AccountDisabled` are
    /// folded into one wording so login never reveals which case applied.
    fn public_message(&self) -> String {
        match self {
            Self::InvalidCredentials | Self::AccountDisabled => {
                "invalid username or password".to_string()
            }
            Self::Internal(_) => "an internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct Envelope {
    success: bool,
    error: ErrorBody,
    request_id: String,
    timestamp: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        };
        let code = self.code();
        let envelope = Envelope {
            success: false,
            error: ErrorBody {
                code,
                message: self.public_message(),
            },
            request_id: String::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let mut response = (status, Json(envelope)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if matches!(self, Self::Unauthenticated(_)) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer error=\"invalid_token\""),
            );
        }
        response
    }
}

/// Standard 4-digit error code families, per the external error envelope.
pub mod codes {
    /// Input validation / rate limiting.
    pub const INVALID_INPUT: &str = "1001";
    /// Sliding-window admission denial.
    pub const RATE_LIMITED: &str = "1005";
    /// Missing/invalid/expired bearer token.
    pub const UNAUTHENTICATED: &str = "2001";
    /// Authenticated but insufficient role/permission.
    pub const FORBIDDEN: &str = "2002";
    /// Login failure, deliberately shared with `UserNotFound`.
    pub const INVALID_CREDENTIALS: &str = "3004";
    /// Resource not found or not visible to caller.
    pub const NOT_FOUND: &str = "3001";
    /// Upstream call exceeded its deadline.
    pub const DOWNSTREAM_TIMEOUT: &str = "4003";
    /// Non-conforming or error upstream response.
    pub const DOWNSTREAM_ERROR: &str = "5003";
    /// Upstream connection failure.
    pub const DOWNSTREAM_UNAVAILABLE: &str = "5004";
    /// Catch-all internal failure.
    pub const INTERNAL: &str = "5000";
}
