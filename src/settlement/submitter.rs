// Batch submitter: one multi-recipient transfer per batch of claims.
//
// Decides FAILED for anything that goes wrong up to and including the
// submit call. A successful submit records the hash on the claims and hands
// it over; COMPLETED is decided after confirmation.

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, TxHash, U256};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::nonce::NonceAllocator;
use crate::chain::{ChainClient, TransferCall};
use crate::error::{AppResult, ChainError};
use crate::ledger::models::{Claim, ClaimStatus};
use crate::ledger::ClaimStore;

/// Fresh nonces tried after the first one is reported as used
const MAX_NONCE_RETRIES: u32 = 2;

/// Gas limit = estimate × 120%
const GAS_BUFFER_PERCENT: u64 = 120;

/// A batch that reached the network
#[derive(Debug, Clone)]
pub struct SubmittedBatch {
    pub tx_hash: TxHash,
    pub nonce: u64,
    pub gas_limit: u64,
    pub claims: Vec<Claim>,
}

impl SubmittedBatch {
    pub fn claim_ids(&self) -> Vec<Uuid> {
        self.claims.iter().map(|c| c.id).collect()
    }
}

#[derive(Debug)]
pub enum BatchSubmission {
    Submitted(SubmittedBatch),
    /// Every claim was invalid or already taken by another pipeline
    Empty,
    /// Nothing was sent; the claims are FAILED
    Rejected {
        error: ChainError,
        claim_ids: Vec<Uuid>,
    },
}

pub struct BatchSubmitter {
    store: Arc<dyn ClaimStore>,
    chain: Arc<dyn ChainClient>,
    nonces: Arc<NonceAllocator>,
    max_retries: i32,
}

/// Recipient and atomic amount, or why the claim cannot go on chain
fn parse_transfer(claim: &Claim) -> Result<(Address, U256), String> {
    if let Some(reason) = claim.validation_error() {
        return Err(reason.to_string());
    }
    let recipient = claim.recipient_address.as_deref().unwrap_or_default().trim();
    let atomic = claim.amount_atomic.as_deref().unwrap_or_default().trim();

    let address = Address::from_str(recipient)
        .map_err(|e| format!("malformed recipient address {}: {}", recipient, e))?;
    let amount = U256::from_str_radix(atomic, 10)
        .map_err(|e| format!("malformed atomic amount {}: {}", atomic, e))?;
    if amount.is_zero() {
        return Err("atomic amount is zero".to_string());
    }

    Ok((address, amount))
}

impl BatchSubmitter {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        chain: Arc<dyn ChainClient>,
        nonces: Arc<NonceAllocator>,
        max_retries: i32,
    ) -> Self {
        Self {
            store,
            chain,
            nonces,
            max_retries,
        }
    }

    #[instrument(skip(self, claims), fields(claims = claims.len()))]
    pub async fn submit_batch(&self, claims: Vec<Claim>) -> AppResult<BatchSubmission> {
        // ========== PARTITION ==========
        let mut valid = Vec::with_capacity(claims.len());
        for claim in claims {
            match parse_transfer(&claim) {
                Ok((recipient, amount)) => valid.push((claim, recipient, amount)),
                Err(reason) => {
                    warn!(claim_id = %claim.id, %reason, "⚠️ Invalid claim excluded from batch");
                    self.store
                        .mark_invalid(
                            claim.id,
                            &format!("invalid claim data: {}", reason),
                            self.max_retries,
                        )
                        .await?;
                }
            }
        }
        if valid.is_empty() {
            return Ok(BatchSubmission::Empty);
        }

        // ========== TAKE OWNERSHIP ==========
        let ids: Vec<Uuid> = valid.iter().map(|(c, _, _)| c.id).collect();
        let won = self.store.mark_processing(&ids, self.max_retries).await?;
        if won.is_empty() {
            return Ok(BatchSubmission::Empty);
        }

        // claims coming back from FAILED had their retry counted on pickup
        let mut retried = Vec::new();
        let mut call = TransferCall::new();
        let mut claims = Vec::with_capacity(won.len());
        for claim in won {
            let Some((before, recipient, amount)) = valid.iter().find(|(c, _, _)| c.id == claim.id)
            else {
                continue;
            };
            if before.status == ClaimStatus::Failed {
                retried.push(claim.id);
            }
            call.push(*recipient, *amount);
            claims.push(claim);
        }

        // ========== NONCE + GAS ==========
        let signer = self.chain.signer();
        let mut nonce = match self.nonces.allocate(signer).await {
            Ok(nonce) => nonce,
            Err(e) => return self.reject(&claims, &retried, e).await,
        };

        let gas_limit = match self.chain.estimate_gas(&call).await {
            Ok(estimate) => estimate.saturating_mul(GAS_BUFFER_PERCENT) / 100,
            Err(e) => {
                self.nonces.release_unused(signer, nonce).await;
                return self.reject(&claims, &retried, e).await;
            }
        };

        // ========== SUBMIT ==========
        let mut conflicts = 0;
        loop {
            match self.chain.submit(&call, nonce, gas_limit).await {
                Ok(tx_hash) => {
                    self.nonces.bind(signer, nonce, tx_hash).await;
                    let ids: Vec<Uuid> = claims.iter().map(|c| c.id).collect();
                    // the transaction is out either way, so a failed write must
                    // not turn into a rejection
                    if let Err(e) = self.store.record_submission(&ids, &tx_hash.to_string()).await {
                        error!(%tx_hash, error = %e, "❌ Failed to record submitted transaction on claims");
                    }
                    info!(
                        %tx_hash,
                        nonce,
                        gas_limit,
                        recipients = call.len(),
                        "✓ Batch submitted"
                    );
                    return Ok(BatchSubmission::Submitted(SubmittedBatch {
                        tx_hash,
                        nonce,
                        gas_limit,
                        claims,
                    }));
                }
                Err(ChainError::NonceConflict(msg)) if conflicts < MAX_NONCE_RETRIES => {
                    conflicts += 1;
                    warn!(nonce, attempt = conflicts, error = %msg, "🔄 Nonce conflict, retrying with a fresh nonce");
                    nonce = match self.nonces.reallocate_after_conflict(signer, nonce).await {
                        Ok(fresh) => fresh,
                        Err(e) => return self.reject(&claims, &retried, e).await,
                    };
                }
                Err(e @ ChainError::AlreadyKnown(_)) => {
                    // the nonce is spent on a transaction we cannot identify
                    error!(nonce, error = %e, "❌ Transaction already known but its hash was not returned, nonce held");
                    return self.reject(&claims, &retried, e).await;
                }
                Err(e) => {
                    self.nonces.release_unused(signer, nonce).await;
                    return self.reject(&claims, &retried, e).await;
                }
            }
        }
    }

    /// Fail the whole batch. Funds errors are the signer's fault, not the
    /// claim's, so they do not use up a retry.
    async fn reject(
        &self,
        claims: &[Claim],
        retried: &[Uuid],
        error: ChainError,
    ) -> AppResult<BatchSubmission> {
        let claim_ids: Vec<Uuid> = claims.iter().map(|c| c.id).collect();

        let (reason, forgive) = match &error {
            ChainError::InsufficientFunds(_) => {
                error!(
                    claims = claim_ids.len(),
                    error = %error,
                    "❌ Signer cannot pay for batch"
                );
                (format!("insufficient signer funds: {}", error), retried)
            }
            _ => {
                warn!(claims = claim_ids.len(), error = %error, "❌ Batch submission failed");
                (format!("submission failed: {}", error), &[][..])
            }
        };

        self.store.mark_failed(&claim_ids, &reason, forgive).await?;
        Ok(BatchSubmission::Rejected { error, claim_ids })
    }
}
