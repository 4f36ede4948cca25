use super::models::*;
use crate::error::{AppResult, SettlementError};
use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use sqlx::types::BigDecimal;
use sqlx::{PgPool, Postgres, Transaction};
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

/// Claim store used by the settlement engine.
///
/// Every status change is a conditional update keyed on the current status,
/// never read-then-write, so concurrent pipelines cannot pick the same claim.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Debit the user's internal balance and insert a QUEUED claim atomically
    async fn create_claim(&self, claim: NewClaim, max_in_flight: i64) -> AppResult<Claim>;

    async fn get_claim(&self, claim_id: Uuid) -> AppResult<Option<Claim>>;

    /// Valid QUEUED claims first, then FAILED claims whose backoff window has
    /// passed and whose retries are not exhausted
    async fn fetch_eligible(
        &self,
        limit: i64,
        max_retries: i32,
        base_delay: Duration,
    ) -> AppResult<Vec<Claim>>;

    /// QUEUED/FAILED → PROCESSING; returns only the claims this caller won.
    /// `retry_count` is incremented for claims coming from FAILED.
    async fn mark_processing(&self, claim_ids: &[Uuid], max_retries: i32) -> AppResult<Vec<Claim>>;

    /// Attach the hash of a just-broadcast transaction to its PROCESSING claims.
    /// The claims stay out of pickup, stuck-reset and refund until the hash is
    /// resolved by `mark_completed` or `clear_submission`.
    async fn record_submission(&self, claim_ids: &[Uuid], tx_hash: &str) -> AppResult<u64>;

    /// Claims whose recorded transaction never got a final answer: FAILED ones,
    /// and PROCESSING ones untouched for longer than `stale_after`
    async fn unresolved_submissions(&self, stale_after: Duration, limit: i64) -> AppResult<Vec<Claim>>;

    /// The recorded transaction will never pay (reverted or dropped).
    /// Clears the hash and moves PROCESSING claims to FAILED.
    async fn clear_submission(&self, claim_ids: &[Uuid], tx_hash: &str, note: &str) -> AppResult<u64>;

    /// Any non-terminal, non-refunded claim → COMPLETED with the settling hash
    async fn mark_completed(&self, claim_ids: &[Uuid], tx_hash: &str) -> AppResult<u64>;

    /// PROCESSING → FAILED with an audit line. Claims listed in
    /// `forgive_retry_for` get back the retry increment from `mark_processing`.
    async fn mark_failed(
        &self,
        claim_ids: &[Uuid],
        reason: &str,
        forgive_retry_for: &[Uuid],
    ) -> AppResult<u64>;

    /// QUEUED → FAILED for structurally invalid data. The claim is made
    /// non-retryable so the refund path picks it up.
    async fn mark_invalid(&self, claim_id: Uuid, reason: &str, max_retries: i32) -> AppResult<bool>;

    /// PROCESSING older than `timeout` and with no recorded transaction → QUEUED
    async fn reset_stuck_processing(&self, timeout: Duration) -> AppResult<u64>;

    /// Every QUEUED claim missing recipient or atomic amount → FAILED
    async fn quarantine_invalid_queued(&self, max_retries: i32) -> AppResult<u64>;

    /// FAILED, not refunded, with recipient and atomic amount present
    async fn failed_for_reconciliation(&self, limit: i64) -> AppResult<Vec<Claim>>;

    /// COMPLETED claims already attributed to any of these transactions
    async fn completed_for_transactions(&self, tx_hashes: &[String]) -> AppResult<Vec<Claim>>;

    /// FAILED → COMPLETED for a claim found settled on chain.
    /// Returns false when the claim was no longer FAILED (already corrected).
    async fn reconcile_completed(&self, claim_id: Uuid, tx_hash: &str, note: &str) -> AppResult<bool>;

    async fn exhausted_unrefunded(&self, max_retries: i32, limit: i64) -> AppResult<Vec<Claim>>;

    /// Mark permanently failed and credit `amount` back in one transaction.
    /// Returns false when the refund marker is already present.
    async fn refund_permanently_failed(
        &self,
        claim_id: Uuid,
        max_retries: i32,
        note: &str,
    ) -> AppResult<bool>;

    async fn stats(&self, max_retries: i32) -> AppResult<ClaimStats>;
}

const CLAIM_COLUMNS: &str = r#"
    id, user_id, amount, amount_atomic, recipient_address,
    status, retry_count, batch_transaction_hash, pending_tx_hash, error_message,
    permanently_failed_at, created_at, updated_at
"#;

/// Claims with both settlement fields present
const VALID_FOR_BATCHING: &str = r#"
    recipient_address IS NOT NULL AND btrim(recipient_address) <> ''
    AND amount_atomic IS NOT NULL AND btrim(amount_atomic) <> ''
"#;

/// Appends `$n` to the audit trail
fn append_note_sql(param: usize) -> String {
    format!(
        "CASE WHEN error_message IS NULL OR error_message = '' THEN ${p} \
         ELSE error_message || E'\\n' || ${p} END",
        p = param
    )
}

fn to_big_decimal(amount: Decimal) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&amount.to_string())
        .map_err(|e| crate::error::AppError::InvalidInput(format!("Invalid decimal: {}", e)))
}

fn into_claims(rows: Vec<ClaimRow>) -> AppResult<Vec<Claim>> {
    rows.into_iter().map(Claim::try_from).collect()
}

/// Ledger repository - THE source of truth for claims and internal balances
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Credit a user's internal balance inside an open transaction
    async fn credit_balance(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        amount: BigDecimal,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_balances (user_id, balance)
            VALUES ($1, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET
                balance = user_balances.balance + EXCLUDED.balance,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ClaimStore for LedgerRepository {
    // ========== CLAIM CREATION ==========

    async fn create_claim(&self, claim: NewClaim, max_in_flight: i64) -> AppResult<Claim> {
        let amount = to_big_decimal(claim.amount)?;
        let mut tx = self.begin_tx().await?;

        // Row lock on the balance serializes concurrent creations per user
        let balance: Option<(BigDecimal,)> = sqlx::query_as(
            "SELECT balance FROM user_balances WHERE user_id = $1 FOR UPDATE",
        )
        .bind(claim.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if balance.is_none() {
            return Err(SettlementError::InsufficientBalance {
                required: claim.amount.to_string(),
            }
            .into());
        }

        let (in_flight,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM claims
            WHERE user_id = $1 AND status IN ('queued', 'processing')
            "#,
        )
        .bind(claim.user_id)
        .fetch_one(&mut *tx)
        .await?;

        if in_flight >= max_in_flight {
            return Err(SettlementError::UserClaimLimit {
                user_id: claim.user_id,
                in_flight,
                limit: max_in_flight,
            }
            .into());
        }

        let debited = sqlx::query(
            r#"
            UPDATE user_balances
            SET balance = balance - $2, updated_at = NOW()
            WHERE user_id = $1 AND balance >= $2
            "#,
        )
        .bind(claim.user_id)
        .bind(amount.clone())
        .execute(&mut *tx)
        .await?;

        if debited.rows_affected() == 0 {
            return Err(SettlementError::InsufficientBalance {
                required: claim.amount.to_string(),
            }
            .into());
        }

        let row = sqlx::query_as::<_, ClaimRow>(&format!(
            r#"
            INSERT INTO claims (user_id, amount, amount_atomic, recipient_address, status)
            VALUES ($1, $2, $3, $4, 'queued')
            RETURNING {}
            "#,
            CLAIM_COLUMNS
        ))
        .bind(claim.user_id)
        .bind(amount)
        .bind(claim.amount_atomic)
        .bind(claim.recipient_address)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let created = Claim::try_from(row)?;
        info!(claim_id = %created.id, user_id = %created.user_id, amount = %created.amount, "✓ Claim queued");
        Ok(created)
    }

    async fn get_claim(&self, claim_id: Uuid) -> AppResult<Option<Claim>> {
        let row = sqlx::query_as::<_, ClaimRow>(&format!(
            "SELECT {} FROM claims WHERE id = $1",
            CLAIM_COLUMNS
        ))
        .bind(claim_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Claim::try_from).transpose()
    }

    // ========== PICKUP ==========

    async fn fetch_eligible(
        &self,
        limit: i64,
        max_retries: i32,
        base_delay: Duration,
    ) -> AppResult<Vec<Claim>> {
        let rows = sqlx::query_as::<_, ClaimRow>(&format!(
            r#"
            SELECT {}
            FROM claims
            WHERE {}
              AND pending_tx_hash IS NULL
              AND (
                status = 'queued'
                OR (
                    status = 'failed'
                    AND permanently_failed_at IS NULL
                    AND retry_count < $2
                    AND created_at + ($3 * power(2, retry_count)) * INTERVAL '1 second' <= NOW()
                )
              )
            ORDER BY CASE WHEN status = 'queued' THEN 0 ELSE 1 END, created_at
            LIMIT $1
            "#,
            CLAIM_COLUMNS, VALID_FOR_BATCHING
        ))
        .bind(limit)
        .bind(max_retries)
        .bind(base_delay.num_seconds() as f64)
        .fetch_all(&self.pool)
        .await?;

        into_claims(rows)
    }

    async fn mark_processing(&self, claim_ids: &[Uuid], max_retries: i32) -> AppResult<Vec<Claim>> {
        if claim_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, ClaimRow>(&format!(
            r#"
            UPDATE claims
            SET status = 'processing',
                retry_count = CASE WHEN status = 'failed' THEN retry_count + 1 ELSE retry_count END,
                updated_at = NOW()
            WHERE id = ANY($1)
              AND pending_tx_hash IS NULL
              AND (
                status = 'queued'
                OR (status = 'failed' AND permanently_failed_at IS NULL AND retry_count < $2)
              )
            RETURNING {}
            "#,
            CLAIM_COLUMNS
        ))
        .bind(claim_ids)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() < claim_ids.len() {
            warn!(
                requested = claim_ids.len(),
                acquired = rows.len(),
                "⚠️ Some claims were taken by another worker"
            );
        }

        into_claims(rows)
    }

    // ========== SUBMISSIONS ==========

    async fn record_submission(&self, claim_ids: &[Uuid], tx_hash: &str) -> AppResult<u64> {
        if claim_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE claims
            SET pending_tx_hash = $2, updated_at = NOW()
            WHERE id = ANY($1) AND status = 'processing'
            "#,
        )
        .bind(claim_ids)
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn unresolved_submissions(&self, stale_after: Duration, limit: i64) -> AppResult<Vec<Claim>> {
        let rows = sqlx::query_as::<_, ClaimRow>(&format!(
            r#"
            SELECT {}
            FROM claims
            WHERE pending_tx_hash IS NOT NULL
              AND (
                status = 'failed'
                OR (status = 'processing' AND updated_at < NOW() - $1 * INTERVAL '1 second')
              )
            ORDER BY updated_at
            LIMIT $2
            "#,
            CLAIM_COLUMNS
        ))
        .bind(stale_after.num_seconds() as f64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_claims(rows)
    }

    async fn clear_submission(&self, claim_ids: &[Uuid], tx_hash: &str, note: &str) -> AppResult<u64> {
        if claim_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(&format!(
            r#"
            UPDATE claims
            SET pending_tx_hash = NULL,
                status = CASE WHEN status = 'processing' THEN 'failed'::claim_status ELSE status END,
                error_message = {},
                updated_at = NOW()
            WHERE id = ANY($1) AND pending_tx_hash = $2
            "#,
            append_note_sql(3)
        ))
        .bind(claim_ids)
        .bind(tx_hash)
        .bind(note)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ========== OUTCOMES ==========

    async fn mark_completed(&self, claim_ids: &[Uuid], tx_hash: &str) -> AppResult<u64> {
        if claim_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE claims
            SET status = 'completed',
                batch_transaction_hash = $2,
                pending_tx_hash = NULL,
                updated_at = NOW()
            WHERE id = ANY($1)
              AND status <> 'completed'
              AND permanently_failed_at IS NULL
            "#,
        )
        .bind(claim_ids)
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_failed(
        &self,
        claim_ids: &[Uuid],
        reason: &str,
        forgive_retry_for: &[Uuid],
    ) -> AppResult<u64> {
        if claim_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(&format!(
            r#"
            UPDATE claims
            SET status = 'failed',
                retry_count = CASE WHEN id = ANY($3) THEN GREATEST(retry_count - 1, 0) ELSE retry_count END,
                error_message = {},
                updated_at = NOW()
            WHERE id = ANY($1) AND status = 'processing'
            "#,
            append_note_sql(2)
        ))
        .bind(claim_ids)
        .bind(reason)
        .bind(forgive_retry_for)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_invalid(&self, claim_id: Uuid, reason: &str, max_retries: i32) -> AppResult<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE claims
            SET status = 'failed',
                retry_count = GREATEST(retry_count, $3),
                error_message = {},
                updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
            append_note_sql(2)
        ))
        .bind(claim_id)
        .bind(reason)
        .bind(max_retries)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ========== JANITOR ==========

    async fn reset_stuck_processing(&self, timeout: Duration) -> AppResult<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE claims
            SET status = 'queued',
                error_message = {},
                updated_at = NOW()
            WHERE status = 'processing'
              AND pending_tx_hash IS NULL
              AND updated_at < NOW() - $1 * INTERVAL '1 second'
            "#,
            append_note_sql(2)
        ))
        .bind(timeout.num_seconds() as f64)
        .bind("reset to queued: stuck in processing past timeout")
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn quarantine_invalid_queued(&self, max_retries: i32) -> AppResult<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE claims
            SET status = 'failed',
                retry_count = GREATEST(retry_count, $2),
                error_message = {},
                updated_at = NOW()
            WHERE status = 'queued' AND NOT ({})
            "#,
            append_note_sql(1),
            VALID_FOR_BATCHING
        ))
        .bind("invalid claim data: missing recipient address or atomic amount")
        .bind(max_retries)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ========== RECONCILIATION ==========

    async fn failed_for_reconciliation(&self, limit: i64) -> AppResult<Vec<Claim>> {
        let rows = sqlx::query_as::<_, ClaimRow>(&format!(
            r#"
            SELECT {}
            FROM claims
            WHERE status = 'failed'
              AND permanently_failed_at IS NULL
              AND {}
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
            CLAIM_COLUMNS, VALID_FOR_BATCHING
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_claims(rows)
    }

    async fn completed_for_transactions(&self, tx_hashes: &[String]) -> AppResult<Vec<Claim>> {
        if tx_hashes.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, ClaimRow>(&format!(
            r#"
            SELECT {}
            FROM claims
            WHERE status = 'completed'
              AND batch_transaction_hash = ANY($1)
            "#,
            CLAIM_COLUMNS
        ))
        .bind(tx_hashes)
        .fetch_all(&self.pool)
        .await?;

        into_claims(rows)
    }

    async fn reconcile_completed(&self, claim_id: Uuid, tx_hash: &str, note: &str) -> AppResult<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE claims
            SET status = 'completed',
                batch_transaction_hash = $2,
                pending_tx_hash = NULL,
                error_message = {},
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed' AND permanently_failed_at IS NULL
            "#,
            append_note_sql(3)
        ))
        .bind(claim_id)
        .bind(tx_hash)
        .bind(note)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ========== REFUNDS ==========

    async fn exhausted_unrefunded(&self, max_retries: i32, limit: i64) -> AppResult<Vec<Claim>> {
        let rows = sqlx::query_as::<_, ClaimRow>(&format!(
            r#"
            SELECT {}
            FROM claims
            WHERE status = 'failed'
              AND retry_count >= $1
              AND permanently_failed_at IS NULL
              AND pending_tx_hash IS NULL
            ORDER BY updated_at
            LIMIT $2
            "#,
            CLAIM_COLUMNS
        ))
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_claims(rows)
    }

    async fn refund_permanently_failed(
        &self,
        claim_id: Uuid,
        max_retries: i32,
        note: &str,
    ) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;

        // SECURITY: the marker and the credit commit together or not at all
        let marked: Option<(Uuid, BigDecimal)> = sqlx::query_as(&format!(
            r#"
            UPDATE claims
            SET permanently_failed_at = NOW(),
                error_message = {},
                updated_at = NOW()
            WHERE id = $1
              AND status = 'failed'
              AND retry_count >= $2
              AND permanently_failed_at IS NULL
              AND pending_tx_hash IS NULL
            RETURNING user_id, amount
            "#,
            append_note_sql(3)
        ))
        .bind(claim_id)
        .bind(max_retries)
        .bind(note)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id, amount)) = marked else {
            tx.rollback().await?;
            return Ok(false);
        };

        Self::credit_balance(&mut tx, user_id, amount).await?;
        tx.commit().await?;

        Ok(true)
    }

    // ========== METRICS ==========

    async fn stats(&self, max_retries: i32) -> AppResult<ClaimStats> {
        let stats = sqlx::query_as::<_, ClaimStats>(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (
                    WHERE status = 'failed' AND permanently_failed_at IS NULL AND retry_count < $1
                ) AS retry_eligible,
                COUNT(*) FILTER (WHERE permanently_failed_at IS NOT NULL) AS permanently_failed,
                COUNT(*) FILTER (WHERE status <> 'completed' AND NOT ({})) AS invalid,
                COUNT(*) FILTER (
                    WHERE status <> 'completed' AND pending_tx_hash IS NOT NULL
                ) AS awaiting_receipt,
                EXTRACT(EPOCH FROM NOW() - MIN(created_at) FILTER (WHERE status = 'queued'))::BIGINT
                    AS oldest_queued_age_secs
            FROM claims
            "#,
            VALID_FOR_BATCHING
        ))
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }
}
