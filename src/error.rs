use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("External error: {0}")]
    ExternalError(String),
}

/// Ledger (chain) errors, classified by how the engine must react to them
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Signer cannot pay for gas or value; batch-level abort
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Nonce too low / already used; retryable with a fresh nonce
    #[error("Nonce conflict: {0}")]
    NonceConflict(String),

    /// The identical signed transaction is already in the mempool; it was
    /// broadcast, so the nonce is spent on it
    #[error("Transaction already known: {0}")]
    AlreadyKnown(String),

    /// Timeouts and connectivity; retryable with backoff
    #[error("Network error: {0}")]
    Network(String),

    /// Definitive rejection by the ledger
    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error("RPC error: {0}")]
    Rpc(String),
}

impl ChainError {
    /// Classify a raw RPC error message.
    ///
    /// Node implementations word these differently, so matching is by
    /// lowercase substring.
    pub fn from_rpc_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("insufficient funds")
            || lower.contains("insufficient balance")
            || lower.contains("gas required exceeds allowance")
        {
            ChainError::InsufficientFunds(message)
        } else if lower.contains("already known") || lower.contains("already imported") {
            ChainError::AlreadyKnown(message)
        } else if lower.contains("nonce too low")
            || lower.contains("nonce already used")
            || lower.contains("nonce has already been used")
            || lower.contains("replacement transaction underpriced")
        {
            ChainError::NonceConflict(message)
        } else if lower.contains("reverted") || lower.contains("execution reverted") {
            ChainError::Reverted(message)
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("econnreset")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("too many requests")
        {
            ChainError::Network(message)
        } else {
            ChainError::Rpc(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Network(_))
    }
}

/// Settlement engine errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("A settlement cycle is already running")]
    CycleInProgress,

    #[error("Signer {signer} cannot afford a single transfer: balance {balance}, required {required}")]
    SignerUnderfunded {
        signer: String,
        balance: String,
        required: String,
    },

    #[error("User {user_id} already has {in_flight} claims in flight (limit {limit})")]
    UserClaimLimit {
        user_id: Uuid,
        in_flight: i64,
        limit: i64,
    },

    #[error("Insufficient internal balance: required {required}")]
    InsufficientBalance { required: String },
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::InvalidInput(reason) | AppError::InvalidAddress(reason) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                reason,
                None,
            ),
            AppError::Settlement(SettlementError::CycleInProgress) => (
                StatusCode::CONFLICT,
                "CYCLE_IN_PROGRESS",
                "A settlement cycle is already running".to_string(),
                None,
            ),
            AppError::Settlement(SettlementError::UserClaimLimit {
                user_id,
                in_flight,
                limit,
            }) => (
                StatusCode::TOO_MANY_REQUESTS,
                "CLAIM_LIMIT_EXCEEDED",
                "Too many claims in flight".to_string(),
                Some(serde_json::json!({
                    "user_id": user_id,
                    "in_flight": in_flight,
                    "limit": limit,
                })),
            ),
            AppError::Settlement(SettlementError::InsufficientBalance { required }) => (
                StatusCode::BAD_REQUEST,
                "INSUFFICIENT_BALANCE",
                "Insufficient reward balance".to_string(),
                Some(serde_json::json!({ "required": required })),
            ),
            AppError::Settlement(SettlementError::SignerUnderfunded { signer, .. }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SIGNER_UNDERFUNDED",
                "Settlement signer is underfunded".to_string(),
                Some(serde_json::json!({ "signer": signer })),
            ),
            AppError::Chain(err) => (
                StatusCode::BAD_GATEWAY,
                "CHAIN_ERROR",
                err.to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
