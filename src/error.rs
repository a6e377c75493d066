//! Error handling module
//!
//! Crate-level error type. Subsystem errors fold into four classes:
//! validation, not-found, conflict and transient, plus infrastructure
//! failures. The class decides HTTP status and whether work is retried.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::aggregate::{ProtocolError, StateStoreError};
use crate::bus::{BusError, HandlerError};
use crate::config::ConfigError;
use crate::domain::{AmountError, DomainError};
use crate::ledger::LedgerError;
use crate::wallet::WalletError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // Retryable
    #[error("Temporarily unavailable: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Server errors (5xx)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Storage or bus unavailability; safe to retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transient(_) | AppError::Database(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Conflict(_))
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            // 400 Bad Request
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", Some(msg.clone()))
            }

            // 404 Not Found
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", Some(what.clone())),

            // 409 Conflict
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg.clone())),

            // 503 Service Unavailable
            AppError::Transient(msg) => {
                tracing::warn!("Transient error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", None)
            }

            // 500 Internal Server Error
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::Config(e) => {
                tracing::error!("Config error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "config_error", None)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

// =========================================================================
// Subsystem error conversion
// =========================================================================

impl From<DomainError> for AppError {
    fn from(e: DomainError) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl From<AmountError> for AppError {
    fn from(e: AmountError) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl From<WalletError> for AppError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::Database(e) => AppError::Database(e),
            WalletError::Unavailable(msg) => AppError::Transient(msg),
            WalletError::Validation(msg) => AppError::Validation(msg),
            e if e.is_not_found() => AppError::NotFound(e.to_string()),
            e if e.is_conflict() => AppError::Conflict(e.to_string()),
            e => AppError::Internal(e.to_string()),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Validation(msg) => AppError::Validation(msg),
            LedgerError::Database(e) => AppError::Database(e),
            LedgerError::Unavailable(msg) => AppError::Transient(msg),
        }
    }
}

impl From<BusError> for AppError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Closed | BusError::Unavailable(_) => AppError::Transient(e.to_string()),
            BusError::Database(e) => AppError::Database(e),
            BusError::Serialization(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<StateStoreError> for AppError {
    fn from(e: StateStoreError) -> Self {
        match e {
            StateStoreError::VersionConflict { .. } | StateStoreError::AlreadyExists { .. } => {
                AppError::Conflict(e.to_string())
            }
            StateStoreError::Database(e) => AppError::Database(e),
            StateStoreError::Unavailable(msg) => AppError::Transient(msg),
            StateStoreError::Corrupt(msg) => AppError::Internal(msg),
        }
    }
}

impl From<ProtocolError> for AppError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Domain(e) => e.into(),
            ProtocolError::Store(e) => e.into(),
            ProtocolError::Publish(e) => e.into(),
            ProtocolError::Missing { .. } => AppError::NotFound(e.to_string()),
        }
    }
}

/// How a handler failure is redelivered by the bus
impl From<AppError> for HandlerError {
    fn from(e: AppError) -> Self {
        match e {
            AppError::NotFound(msg) => HandlerError::NotFound(msg),
            e if e.is_retryable() => HandlerError::Transient(e.to_string()),
            // A lost version race is resolved by re-reading state
            AppError::Conflict(msg) => HandlerError::Transient(msg),
            e => HandlerError::Rejected(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_wallet_error_classes() {
        let not_found: AppError = WalletError::TransactionNotFound {
            wallet_id: Uuid::nil(),
            payment_intent_id: "pi_unknown".into(),
        }
        .into();
        assert!(not_found.is_not_found());

        let conflict: AppError = WalletError::DuplicateWallet {
            owner_user_id: "u1".into(),
            app_id: None,
        }
        .into();
        assert!(conflict.is_conflict());

        let transient: AppError = WalletError::Unavailable("down".into()).into();
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_domain_errors_are_validation() {
        let e: AppError = DomainError::UnknownEventType("campaign.exploded".into()).into();
        assert!(matches!(e, AppError::Validation(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AppError::Conflict("x".into()), StatusCode::CONFLICT),
            (AppError::Transient("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (AppError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_handler_error_mapping() {
        assert_eq!(
            HandlerError::from(AppError::NotFound("pi".into())),
            HandlerError::NotFound("pi".into())
        );
        assert!(HandlerError::from(AppError::Transient("down".into())).is_retryable());
        assert!(!HandlerError::from(AppError::Validation("bad".into())).is_retryable());
    }
}
