//! Error types and HTTP error response handling.
//!
//! This module defines all application errors and how they are converted
//! into HTTP responses with appropriate status codes and JSON bodies.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::models::quota::QuotaDecision;
use crate::store::StoreError;

/// Where a superseded device is sent to re-authenticate.
pub const SESSION_EXPIRED_REDIRECT: &str = "/login/expired";

/// Application-wide error type.
///
/// # Error Categories
///
/// - **Validation Errors**: malformed input, rejected before any store access
/// - **Business-Rule Errors**: deterministic key, quota and session outcomes,
///   each with its own code so clients can explain the exact reason
/// - **Transient Errors**: store timeouts and lost optimistic updates, safe
///   for the client to retry
/// - **Fatal Errors**: database failures and impossible states, reported as
///   an opaque internal error
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed (e.g., connection error, query error).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Request body or parameters are invalid.
    ///
    /// The String contains details about what was invalid.
    #[error("Invalid request")]
    InvalidRequest(String),

    /// Admin API key is missing, invalid, or inactive.
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Session headers are missing or malformed.
    #[error("Authentication required")]
    Unauthenticated,

    /// No key matches the normalized code.
    #[error("Key not found")]
    KeyNotFound,

    /// The key was disabled by an administrator.
    #[error("This key has been disabled")]
    KeyDisabled,

    /// A multi-use key reached its use limit.
    #[error("This key has no uses left")]
    KeyExhausted,

    /// The activation deadline passed before redemption.
    #[error("This key expired before it was activated")]
    KeyExpiredForActivation,

    /// A single-use key was already redeemed.
    #[error("This key has already been used")]
    KeyAlreadyUsed,

    /// An already-used key cannot be deleted, only disabled.
    #[error("This key has been used and can only be disabled")]
    KeyInUse,

    /// Requested account does not exist or is not the caller's.
    #[error("Account not found")]
    AccountNotFound,

    /// Temporary boost does not exist.
    #[error("Temporary boost not found")]
    BoostNotFound,

    /// At least one quota window has no allowance left.
    #[error("Usage limit reached")]
    QuotaExceeded(Box<QuotaDecision>),

    /// Another device logged in to this account.
    #[error("Session expired, please sign in again")]
    SessionSuperseded,

    /// Store timed out or an optimistic update lost a race. Retryable.
    #[error("Temporarily unavailable, please retry")]
    PersistenceConflict,

    /// Impossible state or invalid stored configuration.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict | StoreError::Timeout => AppError::PersistenceConflict,
            StoreError::Database(e) => AppError::Database(e),
        }
    }
}

impl AppError {
    /// Stable machine-readable code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) | AppError::Internal(_) => "internal_error",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::InvalidApiKey => "invalid_api_key",
            AppError::Unauthenticated => "unauthenticated",
            AppError::KeyNotFound => "key_not_found",
            AppError::KeyDisabled => "key_disabled",
            AppError::KeyExhausted => "key_exhausted",
            AppError::KeyExpiredForActivation => "key_expired_for_activation",
            AppError::KeyAlreadyUsed => "key_already_used",
            AppError::KeyInUse => "key_in_use",
            AppError::AccountNotFound => "account_not_found",
            AppError::BoostNotFound => "boost_not_found",
            AppError::QuotaExceeded(_) => "quota_exceeded",
            AppError::SessionSuperseded => "session_superseded",
            AppError::PersistenceConflict => "persistence_conflict",
        }
    }

    /// Whether the client may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::PersistenceConflict)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidApiKey | AppError::Unauthenticated | AppError::SessionSuperseded => {
                StatusCode::UNAUTHORIZED
            }
            AppError::KeyNotFound | AppError::AccountNotFound | AppError::BoostNotFound => {
                StatusCode::NOT_FOUND
            }
            AppError::KeyDisabled
            | AppError::KeyExhausted
            | AppError::KeyExpiredForActivation
            | AppError::KeyAlreadyUsed
            | AppError::KeyInUse => StatusCode::CONFLICT,
            AppError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::PersistenceConflict => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// ```json
/// {
///   "error": {
///     "code": "key_already_used",
///     "message": "This key has already been used",
///     "retryable": false
///   }
/// }
/// ```
///
/// Quota denials add a `quota` object with both windows; a superseded
/// session adds `redirect` and a `Location` header.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let retryable = self.is_retryable();

        let message = match &self {
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                "An internal error occurred".to_string()
            }
            AppError::Internal(detail) => {
                tracing::error!(%detail, "internal error");
                "An internal error occurred".to_string()
            }
            AppError::InvalidRequest(msg) => msg.clone(),
            other => other.to_string(),
        };

        let mut error = json!({
            "code": code,
            "message": message,
            "retryable": retryable,
        });

        match &self {
            AppError::QuotaExceeded(decision) => {
                error["quota"] = json!(decision.as_ref());
            }
            AppError::SessionSuperseded => {
                error["redirect"] = json!(SESSION_EXPIRED_REDIRECT);
            }
            _ => {}
        }

        let body = Json(json!({ "error": error }));

        if matches!(self, AppError::SessionSuperseded) {
            return (
                status,
                [(header::LOCATION, SESSION_EXPIRED_REDIRECT)],
                body,
            )
                .into_response();
        }

        (status, body).into_response()
    }
}
