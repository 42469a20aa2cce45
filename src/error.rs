//! Error types and HTTP error response handling.
//!
//! This module defines:
//! - `Rejection`: expected business rejections, returned as structured results
//! - `EngineError`: fatal consistency failures that abort the store transaction
//! - `StoreError`, `LockError`, `ProviderError`: collaborator failures
//! - `AppError`: how failures at the HTTP edge become responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use uuid::Uuid;

/// Business rejection of an event.
///
/// Never raised as an error across the webhook boundary; the router turns
/// it into `{status, reason}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    CardNotFound,
    CardUserNotFound,
    CardNotActive,
    InsufficientBalance,
    UnauthorizedCardAccess,
    InvalidStatusTransition,
    AmountMismatch,
    InvalidAmountForDeclined,
}

impl Rejection {
    /// Stable reason code returned to the provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::CardNotFound => "card_not_found",
            Rejection::CardUserNotFound => "card_user_not_found",
            Rejection::CardNotActive => "card_not_active",
            Rejection::InsufficientBalance => "insufficient_balance",
            Rejection::UnauthorizedCardAccess => "unauthorized_card_access",
            Rejection::InvalidStatusTransition => "invalid_status_transition",
            Rejection::AmountMismatch => "amount_mismatch",
            Rejection::InvalidAmountForDeclined => "invalid_amount_for_declined",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row holds a value the domain types cannot represent
    #[error("Corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
}

/// Distributed lock failure. Always retryable.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Timed out waiting for lock {key}")]
    Timeout { key: String },

    #[error("Lock backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Outbound provider or notification call failure. Always best-effort.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Fatal failure of a balance mutation.
///
/// Raised inside the store transaction so that dropping it rolls back
/// every write made so far.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} {id} not found during balance update")]
    NotFoundDuringBalanceUpdate { entity: &'static str, id: Uuid },

    #[error("Balance update verification failed for {entity} {id}: expected {expected}, found {actual:?}")]
    VerificationFailed {
        entity: &'static str,
        id: Uuid,
        expected: i64,
        actual: Option<i64>,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Amount {0} exceeds the maximum safe integer")]
    AmountExceedsSafeInteger(String),

    #[error("Amount to credit must be positive (amount {amount}, fee {fee})")]
    NonPositiveCredit { amount: i64, fee: i64 },

    #[error("Balance of {entity} {id} would become negative")]
    NegativeBalance { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl EngineError {
    /// Infrastructure failures the sender should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Lock(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Store(StoreError::Database(err))
    }
}

/// Application-wide HTTP error type.
///
/// # Error Categories
///
/// - **Signature Errors**: missing or invalid provider signature
/// - **Request Errors**: body is not a webhook envelope
/// - **Retryable Errors**: lock or store temporarily unavailable
/// - **Database Errors**: health check failures
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] StoreError),

    /// Signature header missing or not matching the body.
    ///
    /// Returns HTTP 401 Unauthorized.
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Request body is not a valid envelope.
    ///
    /// Returns HTTP 400 Bad Request.
    #[error("Invalid request")]
    InvalidRequest(String),

    /// Processing could not start; the provider should retry.
    ///
    /// Returns HTTP 503 Service Unavailable.
    #[error("Service temporarily unavailable")]
    Unavailable(String),
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// ```json
/// {
///   "error": {
///     "code": "error_type",
///     "message": "Human-readable error message"
///   }
/// }
/// ```
///
/// Internal details are logged, never returned.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                "invalid_signature",
                self.to_string(),
            ),
            AppError::InvalidRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            AppError::Unavailable(ref detail) => {
                tracing::warn!(detail = %detail, "Webhook processing deferred to provider retry");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service_unavailable",
                    self.to_string(),
                )
            }
            AppError::Database(ref err) => {
                tracing::error!(error = %err, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
