use crate::ledger::models::*;
use crate::settlement::nonce::InFlightNonce;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// ========== REQUEST MODELS ==========

/// Request to cash out part of a user's internal reward balance
#[derive(Debug, Deserialize, Validate)]
pub struct CreateClaimRequest {
    pub user_id: Uuid,

    /// Decimal string or number
    pub amount: Decimal,

    #[validate(length(min = 40, max = 42, message = "must be a 20-byte hex address"))]
    pub recipient_address: String,

    /// Token decimals on the ledger; 18 when omitted
    #[validate(range(max = 36, message = "at most 36 decimals"))]
    pub decimals: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunSettlementRequest {
    #[serde(default)]
    pub force: bool,
}

/// Abandon one nonce, or every nonce past the cooling-off period
#[derive(Debug, Default, Deserialize)]
pub struct AbandonNoncesRequest {
    pub nonce: Option<u64>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub claim_id: Uuid,
    pub user_id: Uuid,
    pub amount: String,
    pub amount_atomic: Option<String>,
    pub recipient_address: Option<String>,
    pub status: ClaimStatus,
    pub retry_count: i32,
    pub batch_transaction_hash: Option<String>,
    /// Broadcast transaction whose outcome is still unknown
    pub pending_tx_hash: Option<String>,
    pub error_message: Option<String>,
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Claim> for ClaimResponse {
    fn from(claim: Claim) -> Self {
        Self {
            claim_id: claim.id,
            user_id: claim.user_id,
            amount: claim.amount.to_string(),
            amount_atomic: claim.amount_atomic,
            recipient_address: claim.recipient_address,
            status: claim.status,
            retry_count: claim.retry_count,
            batch_transaction_hash: claim.batch_transaction_hash,
            pending_tx_hash: claim.pending_tx_hash,
            error_message: claim.error_message,
            refunded: claim.permanently_failed_at.is_some(),
            created_at: claim.created_at,
            updated_at: claim.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SettlementStatsResponse {
    #[serde(flatten)]
    pub claims: ClaimStats,
    pub in_flight_nonces: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct NoncesResponse {
    pub signer: String,
    pub in_flight: Vec<InFlightNonce>,
}

#[derive(Debug, Serialize)]
pub struct AbandonNoncesResponse {
    pub signer: String,
    pub abandoned: Vec<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub signer: String,
    pub settlement_enabled: bool,
}
