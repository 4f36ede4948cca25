use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::BigDecimal, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Claim status enum
///
/// QUEUED → PROCESSING → COMPLETED, with PROCESSING → FAILED,
/// PROCESSING → QUEUED (stuck reset), FAILED → PROCESSING (retry),
/// FAILED → COMPLETED (reconciliation) and QUEUED → FAILED (invalid data).
/// COMPLETED is terminal. The stores enforce these as conditional updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "claim_status", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum ClaimStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Queued => "queued",
            ClaimStatus::Processing => "processing",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Failed => "failed",
        }
    }
}

/// Claim entity - the unit of settlement work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub user_id: Uuid,

    /// Human-readable reward quantity, equal to what was debited at creation
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,

    /// Ledger-precision integer amount, decimal string
    pub amount_atomic: Option<String>,
    pub recipient_address: Option<String>,

    pub status: ClaimStatus,
    pub retry_count: i32,
    pub batch_transaction_hash: Option<String>,

    /// Hash of the last broadcast transaction carrying this claim, held until
    /// its outcome is known. While set, the claim is neither resubmitted,
    /// requeued nor refunded.
    pub pending_tx_hash: Option<String>,

    /// Append-only audit trail, one line per event
    pub error_message: Option<String>,

    /// Set together with the refund credit; presence means "already refunded"
    pub permanently_failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Claim {
    /// Reason this claim can never be put on chain, if any
    pub fn validation_error(&self) -> Option<&'static str> {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());

        match (blank(&self.recipient_address), blank(&self.amount_atomic)) {
            (true, true) => Some("missing recipient address and atomic amount"),
            (true, false) => Some("missing recipient address"),
            (false, true) => Some("missing atomic amount"),
            (false, false) => None,
        }
    }

    pub fn is_valid_for_batching(&self) -> bool {
        self.validation_error().is_none()
    }

    /// Earliest time a FAILED claim may be picked up again:
    /// `created_at + base_delay × 2^retry_count`
    pub fn next_retry_at(&self, base_delay: Duration) -> DateTime<Utc> {
        let exponent = self.retry_count.clamp(0, 30) as u32;
        let factor = 2i32.saturating_pow(exponent);
        self.created_at + base_delay * factor
    }

    /// Whether the pickup scan may take this claim right now
    pub fn is_pickup_eligible(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        base_delay: Duration,
    ) -> bool {
        if !self.is_valid_for_batching() || self.awaits_receipt() {
            return false;
        }
        match self.status {
            ClaimStatus::Queued => true,
            ClaimStatus::Failed => {
                self.permanently_failed_at.is_none()
                    && self.retry_count < max_retries
                    && self.next_retry_at(base_delay) <= now
            }
            ClaimStatus::Processing | ClaimStatus::Completed => false,
        }
    }

    /// A broadcast transaction for this claim may still land
    pub fn awaits_receipt(&self) -> bool {
        self.pending_tx_hash.is_some()
    }

    /// Out of retries, not yet refunded, and nothing left on the wire
    pub fn is_exhausted(&self, max_retries: i32) -> bool {
        self.status == ClaimStatus::Failed
            && self.retry_count >= max_retries
            && self.permanently_failed_at.is_none()
            && !self.awaits_receipt()
    }
}

/// Row shape as stored; `amount` is NUMERIC
#[derive(Debug, FromRow)]
pub struct ClaimRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub amount_atomic: Option<String>,
    pub recipient_address: Option<String>,
    pub status: ClaimStatus,
    pub retry_count: i32,
    pub batch_transaction_hash: Option<String>,
    pub pending_tx_hash: Option<String>,
    pub error_message: Option<String>,
    pub permanently_failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ClaimRow> for Claim {
    type Error = AppError;

    fn try_from(row: ClaimRow) -> AppResult<Self> {
        let amount = Decimal::from_str(&row.amount.to_string())?;
        Ok(Claim {
            id: row.id,
            user_id: row.user_id,
            amount,
            amount_atomic: row.amount_atomic,
            recipient_address: row.recipient_address,
            status: row.status,
            retry_count: row.retry_count,
            batch_transaction_hash: row.batch_transaction_hash,
            pending_tx_hash: row.pending_tx_hash,
            error_message: row.error_message,
            permanently_failed_at: row.permanently_failed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// New claim as handed over by the claim-creation flow
#[derive(Debug, Clone)]
pub struct NewClaim {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub amount_atomic: String,
    pub recipient_address: String,
}

/// Operational metrics over the claim store, used for alerting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ClaimStats {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retry_eligible: i64,
    pub permanently_failed: i64,
    pub invalid: i64,
    /// Not completed, with a broadcast transaction still unresolved
    pub awaiting_receipt: i64,
    pub oldest_queued_age_secs: Option<i64>,
}

/// Append an audit line to an existing trail
pub fn append_note(existing: Option<&str>, note: &str) -> String {
    match existing {
        Some(prev) if !prev.is_empty() => format!("{}\n{}", prev, note),
        _ => note.to_string(),
    }
}
