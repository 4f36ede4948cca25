// In-memory claim store for engine tests.
//
// Mirrors the conditional-update semantics of the Postgres repository: every
// transition checks the current status under one lock.

use super::models::*;
use super::repository::ClaimStore;
use crate::error::{AppResult, SettlementError};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct State {
    claims: HashMap<Uuid, Claim>,
    balances: HashMap<Uuid, Decimal>,
}

#[derive(Default)]
pub struct MemoryClaimStore {
    state: Mutex<State>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, user_id: Uuid, amount: Decimal) {
        self.state.lock().balances.insert(user_id, amount);
    }

    /// Insert a claim as-is, bypassing creation checks
    pub fn insert(&self, claim: Claim) {
        self.state.lock().claims.insert(claim.id, claim);
    }

    pub fn claim(&self, claim_id: Uuid) -> Claim {
        self.state.lock().claims[&claim_id].clone()
    }

    /// Rewrite a claim in place, e.g. to age its timestamps
    pub fn update(&self, claim_id: Uuid, f: impl FnOnce(&mut Claim)) {
        if let Some(claim) = self.state.lock().claims.get_mut(&claim_id) {
            f(claim);
        }
    }

    pub fn balance(&self, user_id: Uuid) -> Decimal {
        self.state
            .lock()
            .balances
            .get(&user_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

/// QUEUED claim paying `amount` tokens (18 decimals) to `recipient`
pub fn queued_claim(user_id: Uuid, amount: Decimal, recipient: &str) -> Claim {
    let now = Utc::now();
    let atomic = (amount * Decimal::from(1_000_000_000_000_000_000u64)).trunc();
    Claim {
        id: Uuid::new_v4(),
        user_id,
        amount,
        amount_atomic: Some(atomic.to_string()),
        recipient_address: Some(recipient.to_string()),
        status: ClaimStatus::Queued,
        retry_count: 0,
        batch_transaction_hash: None,
        pending_tx_hash: None,
        error_message: None,
        permanently_failed_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn note(claim: &mut Claim, text: &str) {
    claim.error_message = Some(append_note(claim.error_message.as_deref(), text));
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn create_claim(&self, new: NewClaim, max_in_flight: i64) -> AppResult<Claim> {
        let mut state = self.state.lock();

        let in_flight = state
            .claims
            .values()
            .filter(|c| {
                c.user_id == new.user_id
                    && matches!(c.status, ClaimStatus::Queued | ClaimStatus::Processing)
            })
            .count() as i64;
        if in_flight >= max_in_flight {
            return Err(SettlementError::UserClaimLimit {
                user_id: new.user_id,
                in_flight,
                limit: max_in_flight,
            }
            .into());
        }

        let balance = state.balances.entry(new.user_id).or_insert(Decimal::ZERO);
        if *balance < new.amount {
            return Err(SettlementError::InsufficientBalance {
                required: new.amount.to_string(),
            }
            .into());
        }
        *balance -= new.amount;

        let now = Utc::now();
        let claim = Claim {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            amount: new.amount,
            amount_atomic: Some(new.amount_atomic),
            recipient_address: Some(new.recipient_address),
            status: ClaimStatus::Queued,
            retry_count: 0,
            batch_transaction_hash: None,
            pending_tx_hash: None,
            error_message: None,
            permanently_failed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.claims.insert(claim.id, claim.clone());
        Ok(claim)
    }

    async fn get_claim(&self, claim_id: Uuid) -> AppResult<Option<Claim>> {
        Ok(self.state.lock().claims.get(&claim_id).cloned())
    }

    async fn fetch_eligible(
        &self,
        limit: i64,
        max_retries: i32,
        base_delay: Duration,
    ) -> AppResult<Vec<Claim>> {
        let now = Utc::now();
        let mut eligible: Vec<Claim> = self
            .state
            .lock()
            .claims
            .values()
            .filter(|c| c.is_pickup_eligible(now, max_retries, base_delay))
            .cloned()
            .collect();

        eligible.sort_by_key(|c| (c.status != ClaimStatus::Queued, c.created_at));
        eligible.truncate(limit.max(0) as usize);
        Ok(eligible)
    }

    async fn mark_processing(&self, claim_ids: &[Uuid], max_retries: i32) -> AppResult<Vec<Claim>> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut won = Vec::new();

        for id in claim_ids {
            let Some(claim) = state.claims.get_mut(id) else { continue };
            if claim.awaits_receipt() {
                continue;
            }
            let takeable = match claim.status {
                ClaimStatus::Queued => true,
                ClaimStatus::Failed => {
                    claim.permanently_failed_at.is_none() && claim.retry_count < max_retries
                }
                _ => false,
            };
            if !takeable {
                continue;
            }
            if claim.status == ClaimStatus::Failed {
                claim.retry_count += 1;
            }
            claim.status = ClaimStatus::Processing;
            claim.updated_at = now;
            won.push(claim.clone());
        }

        Ok(won)
    }

    async fn record_submission(&self, claim_ids: &[Uuid], tx_hash: &str) -> AppResult<u64> {
        let mut state = self.state.lock();
        let mut updated = 0;

        for id in claim_ids {
            let Some(claim) = state.claims.get_mut(id) else { continue };
            if claim.status != ClaimStatus::Processing {
                continue;
            }
            claim.pending_tx_hash = Some(tx_hash.to_string());
            claim.updated_at = Utc::now();
            updated += 1;
        }

        Ok(updated)
    }

    async fn unresolved_submissions(&self, stale_after: Duration, limit: i64) -> AppResult<Vec<Claim>> {
        let cutoff = Utc::now() - stale_after;
        let mut unresolved: Vec<Claim> = self
            .state
            .lock()
            .claims
            .values()
            .filter(|c| {
                c.awaits_receipt()
                    && (c.status == ClaimStatus::Failed
                        || (c.status == ClaimStatus::Processing && c.updated_at < cutoff))
            })
            .cloned()
            .collect();

        unresolved.sort_by_key(|c| c.updated_at);
        unresolved.truncate(limit.max(0) as usize);
        Ok(unresolved)
    }

    async fn clear_submission(&self, claim_ids: &[Uuid], tx_hash: &str, text: &str) -> AppResult<u64> {
        let mut state = self.state.lock();
        let mut updated = 0;

        for id in claim_ids {
            let Some(claim) = state.claims.get_mut(id) else { continue };
            if claim.pending_tx_hash.as_deref() != Some(tx_hash) {
                continue;
            }
            claim.pending_tx_hash = None;
            if claim.status == ClaimStatus::Processing {
                claim.status = ClaimStatus::Failed;
            }
            claim.updated_at = Utc::now();
            note(claim, text);
            updated += 1;
        }

        Ok(updated)
    }

    async fn mark_completed(&self, claim_ids: &[Uuid], tx_hash: &str) -> AppResult<u64> {
        let mut state = self.state.lock();
        let mut updated = 0;

        for id in claim_ids {
            let Some(claim) = state.claims.get_mut(id) else { continue };
            if claim.status == ClaimStatus::Completed || claim.permanently_failed_at.is_some() {
                continue;
            }
            claim.status = ClaimStatus::Completed;
            claim.batch_transaction_hash = Some(tx_hash.to_string());
            claim.pending_tx_hash = None;
            claim.updated_at = Utc::now();
            updated += 1;
        }

        Ok(updated)
    }

    async fn mark_failed(
        &self,
        claim_ids: &[Uuid],
        reason: &str,
        forgive_retry_for: &[Uuid],
    ) -> AppResult<u64> {
        let mut state = self.state.lock();
        let mut updated = 0;

        for id in claim_ids {
            let Some(claim) = state.claims.get_mut(id) else { continue };
            if claim.status != ClaimStatus::Processing {
                continue;
            }
            if forgive_retry_for.contains(id) {
                claim.retry_count = (claim.retry_count - 1).max(0);
            }
            claim.status = ClaimStatus::Failed;
            claim.updated_at = Utc::now();
            note(claim, reason);
            updated += 1;
        }

        Ok(updated)
    }

    async fn mark_invalid(&self, claim_id: Uuid, reason: &str, max_retries: i32) -> AppResult<bool> {
        let mut state = self.state.lock();
        let Some(claim) = state.claims.get_mut(&claim_id) else {
            return Ok(false);
        };
        if claim.status != ClaimStatus::Queued {
            return Ok(false);
        }
        claim.status = ClaimStatus::Failed;
        claim.retry_count = claim.retry_count.max(max_retries);
        claim.updated_at = Utc::now();
        note(claim, reason);
        Ok(true)
    }

    async fn reset_stuck_processing(&self, timeout: Duration) -> AppResult<u64> {
        let mut state = self.state.lock();
        let cutoff = Utc::now() - timeout;
        let mut reset = 0;

        for claim in state.claims.values_mut() {
            if claim.status == ClaimStatus::Processing
                && !claim.awaits_receipt()
                && claim.updated_at < cutoff
            {
                claim.status = ClaimStatus::Queued;
                claim.updated_at = Utc::now();
                note(claim, "reset to queued: stuck in processing past timeout");
                reset += 1;
            }
        }

        Ok(reset)
    }

    async fn quarantine_invalid_queued(&self, max_retries: i32) -> AppResult<u64> {
        let mut state = self.state.lock();
        let mut moved = 0;

        for claim in state.claims.values_mut() {
            if claim.status == ClaimStatus::Queued && !claim.is_valid_for_batching() {
                claim.status = ClaimStatus::Failed;
                claim.retry_count = claim.retry_count.max(max_retries);
                claim.updated_at = Utc::now();
                note(
                    claim,
                    "invalid claim data: missing recipient address or atomic amount",
                );
                moved += 1;
            }
        }

        Ok(moved)
    }

    async fn failed_for_reconciliation(&self, limit: i64) -> AppResult<Vec<Claim>> {
        let mut failed: Vec<Claim> = self
            .state
            .lock()
            .claims
            .values()
            .filter(|c| {
                c.status == ClaimStatus::Failed
                    && c.permanently_failed_at.is_none()
                    && c.is_valid_for_batching()
            })
            .cloned()
            .collect();

        failed.sort_by_key(|c| std::cmp::Reverse(c.updated_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn completed_for_transactions(&self, tx_hashes: &[String]) -> AppResult<Vec<Claim>> {
        Ok(self
            .state
            .lock()
            .claims
            .values()
            .filter(|c| {
                c.status == ClaimStatus::Completed
                    && c.batch_transaction_hash
                        .as_ref()
                        .is_some_and(|h| tx_hashes.contains(h))
            })
            .cloned()
            .collect())
    }

    async fn reconcile_completed(&self, claim_id: Uuid, tx_hash: &str, text: &str) -> AppResult<bool> {
        let mut state = self.state.lock();
        let Some(claim) = state.claims.get_mut(&claim_id) else {
            return Ok(false);
        };
        if claim.status != ClaimStatus::Failed || claim.permanently_failed_at.is_some() {
            return Ok(false);
        }
        claim.status = ClaimStatus::Completed;
        claim.batch_transaction_hash = Some(tx_hash.to_string());
        claim.pending_tx_hash = None;
        claim.updated_at = Utc::now();
        note(claim, text);
        Ok(true)
    }

    async fn exhausted_unrefunded(&self, max_retries: i32, limit: i64) -> AppResult<Vec<Claim>> {
        let mut exhausted: Vec<Claim> = self
            .state
            .lock()
            .claims
            .values()
            .filter(|c| c.is_exhausted(max_retries))
            .cloned()
            .collect();

        exhausted.sort_by_key(|c| c.updated_at);
        exhausted.truncate(limit.max(0) as usize);
        Ok(exhausted)
    }

    async fn refund_permanently_failed(
        &self,
        claim_id: Uuid,
        max_retries: i32,
        text: &str,
    ) -> AppResult<bool> {
        let mut state = self.state.lock();
        let Some(claim) = state.claims.get_mut(&claim_id) else {
            return Ok(false);
        };
        if !claim.is_exhausted(max_retries) {
            return Ok(false);
        }
        claim.permanently_failed_at = Some(Utc::now());
        claim.updated_at = Utc::now();
        note(claim, text);

        let (user_id, amount) = (claim.user_id, claim.amount);
        *state.balances.entry(user_id).or_insert(Decimal::ZERO) += amount;
        Ok(true)
    }

    async fn stats(&self, max_retries: i32) -> AppResult<ClaimStats> {
        let state = self.state.lock();
        let now = Utc::now();
        let mut stats = ClaimStats::default();

        for claim in state.claims.values() {
            match claim.status {
                ClaimStatus::Queued => stats.queued += 1,
                ClaimStatus::Processing => stats.processing += 1,
                ClaimStatus::Completed => stats.completed += 1,
                ClaimStatus::Failed => stats.failed += 1,
            }
            if claim.status == ClaimStatus::Failed
                && claim.permanently_failed_at.is_none()
                && claim.retry_count < max_retries
            {
                stats.retry_eligible += 1;
            }
            if claim.permanently_failed_at.is_some() {
                stats.permanently_failed += 1;
            }
            if claim.status != ClaimStatus::Completed && !claim.is_valid_for_batching() {
                stats.invalid += 1;
            }
            if claim.status != ClaimStatus::Completed && claim.awaits_receipt() {
                stats.awaiting_receipt += 1;
            }
        }

        stats.oldest_queued_age_secs = state
            .claims
            .values()
            .filter(|c| c.status == ClaimStatus::Queued)
            .map(|c| (now - c.created_at).num_seconds())
            .max();

        Ok(stats)
    }
}
