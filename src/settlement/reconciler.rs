// Reconciliation of FAILED claims against recent dispatch transactions.
//
// Repairs claims whose transfer landed on chain although the local record
// says FAILED (crash before the status write, or a poll that gave up early),
// and settles claims still waiting on a transaction that was broadcast but
// never resolved in its own pipeline.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, TxHash, U256};
use chrono::Duration;
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::nonce::NonceAllocator;
use crate::chain::ChainClient;
use crate::error::AppResult;
use crate::ledger::models::Claim;
use crate::ledger::ClaimStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub failed_scanned: usize,
    pub transactions_scanned: usize,
    pub recovered: usize,
    pub nonces_released: usize,
}

/// Outcome of one pass over claims with an unresolved broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubmissionReport {
    pub transactions_checked: usize,
    pub confirmed: usize,
    pub reverted: usize,
    pub dropped: usize,
    pub still_pending: usize,
}

/// Payouts of confirmed dispatch transactions not yet attributed to a claim
#[derive(Default)]
struct PayoutPool {
    /// (recipient, amount) → transactions paying it, one entry per occurrence
    unclaimed: HashMap<(Address, U256), Vec<TxHash>>,
}

impl PayoutPool {
    fn add(&mut self, tx_hash: TxHash, recipient: Address, amount: U256) {
        self.unclaimed.entry((recipient, amount)).or_default().push(tx_hash);
    }

    /// Consume one occurrence, from `tx_hash` if given
    fn take(&mut self, recipient: Address, amount: U256, tx_hash: Option<TxHash>) -> Option<TxHash> {
        let hashes = self.unclaimed.get_mut(&(recipient, amount))?;
        let idx = match tx_hash {
            Some(h) => hashes.iter().position(|x| *x == h)?,
            None => 0,
        };
        if idx >= hashes.len() {
            return None;
        }
        Some(hashes.remove(idx))
    }
}

fn claim_pair(claim: &Claim) -> Option<(Address, U256)> {
    let recipient = Address::from_str(claim.recipient_address.as_deref()?.trim()).ok()?;
    let amount = U256::from_str_radix(claim.amount_atomic.as_deref()?.trim(), 10).ok()?;
    Some((recipient, amount))
}

pub struct ReconciliationScanner {
    store: Arc<dyn ClaimStore>,
    chain: Arc<dyn ChainClient>,
    nonces: Arc<NonceAllocator>,
    lookback_blocks: u64,
    claim_limit: i64,
}

impl ReconciliationScanner {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        chain: Arc<dyn ChainClient>,
        nonces: Arc<NonceAllocator>,
        lookback_blocks: u64,
        claim_limit: i64,
    ) -> Self {
        Self {
            store,
            chain,
            nonces,
            lookback_blocks,
            claim_limit,
        }
    }

    /// Settle claims whose recorded transaction got no final answer in its
    /// own pipeline. A hash is only cleared once the network shows it reverted,
    /// or no longer knows it while no reserved nonce is bound to it.
    #[instrument(skip(self))]
    pub async fn resolve_pending_submissions(&self, stale_after: Duration) -> AppResult<SubmissionReport> {
        let mut report = SubmissionReport::default();
        let signer = self.chain.signer();

        let mut by_hash: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for claim in self
            .store
            .unresolved_submissions(stale_after, self.claim_limit)
            .await?
        {
            if let Some(hash) = claim.pending_tx_hash {
                by_hash.entry(hash).or_default().push(claim.id);
            }
        }
        report.transactions_checked = by_hash.len();

        for (hash, ids) in by_hash {
            let Ok(tx_hash) = TxHash::from_str(&hash) else {
                warn!(%hash, claims = ids.len(), "⚠️ Unreadable pending transaction hash");
                report.still_pending += ids.len();
                continue;
            };

            let receipt = match self.chain.get_receipt(tx_hash).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!(%tx_hash, error = %e, "⚠️ Receipt lookup failed, keeping claims pending");
                    report.still_pending += ids.len();
                    continue;
                }
            };

            match receipt {
                Some(receipt) if receipt.success => {
                    let settled = self.store.mark_completed(&ids, &hash).await?;
                    self.nonces.release_by_hash(signer, tx_hash).await;
                    report.confirmed += settled as usize;
                    info!(%tx_hash, claims = settled, "✓ Late confirmation settled claims");
                }
                Some(_) => {
                    let note = format!("transaction {} reverted", tx_hash);
                    let cleared = self.store.clear_submission(&ids, &hash, &note).await?;
                    self.nonces.release_by_hash(signer, tx_hash).await;
                    report.reverted += cleared as usize;
                    warn!(%tx_hash, claims = cleared, "⚠️ Pending transaction reverted");
                }
                None => {
                    if self.may_still_land(signer, tx_hash).await {
                        report.still_pending += ids.len();
                        debug!(%tx_hash, claims = ids.len(), "transaction still pending");
                        continue;
                    }
                    let note = format!("transaction {} dropped before mining", tx_hash);
                    let cleared = self.store.clear_submission(&ids, &hash, &note).await?;
                    report.dropped += cleared as usize;
                    warn!(%tx_hash, claims = cleared, "⚠️ Pending transaction dropped by the network");
                }
            }
        }

        Ok(report)
    }

    /// Unmined, but either its nonce is still reserved or a node still holds it
    async fn may_still_land(&self, signer: Address, tx_hash: TxHash) -> bool {
        if self.nonces.holds_hash(signer, tx_hash).await {
            return true;
        }
        match self.chain.get_transaction(tx_hash).await {
            Ok(tx) => tx.is_some(),
            Err(e) => {
                warn!(%tx_hash, error = %e, "⚠️ Transaction lookup failed, assuming pending");
                true
            }
        }
    }

    #[instrument(skip(self), fields(lookback = self.lookback_blocks))]
    pub async fn reconcile_recent_failures(&self) -> AppResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let signer = self.chain.signer();

        let head = self.chain.block_number().await?;
        let from = head.saturating_sub(self.lookback_blocks);
        let history = self.chain.dispatch_history(from, head).await?;
        report.transactions_scanned = history.len();

        // ========== CONFIRMED PAYOUTS ==========
        let mut pool = PayoutPool::default();
        let mut confirmed = Vec::new();
        let receipts =
            try_join_all(history.iter().map(|(tx, _)| self.chain.get_receipt(tx.hash))).await?;
        for ((tx, call), receipt) in history.iter().zip(receipts) {
            let Some(receipt) = receipt else {
                continue;
            };

            // mined either way, so its nonce is spent
            if self.nonces.release_by_hash(signer, tx.hash).await.is_some() {
                report.nonces_released += 1;
            }
            if !receipt.success {
                continue;
            }
            for (recipient, amount) in call.pairs() {
                pool.add(tx.hash, recipient, amount);
            }
            confirmed.push(tx.hash);
        }

        let failed = self.store.failed_for_reconciliation(self.claim_limit).await?;
        report.failed_scanned = failed.len();
        if failed.is_empty() || confirmed.is_empty() {
            debug!(
                failed = failed.len(),
                confirmed = confirmed.len(),
                "nothing to reconcile"
            );
            return Ok(report);
        }

        // payouts already credited to COMPLETED claims are not available
        let hashes: Vec<String> = confirmed.iter().map(|h| h.to_string()).collect();
        for claim in self.store.completed_for_transactions(&hashes).await? {
            let settled_by = claim
                .batch_transaction_hash
                .as_deref()
                .and_then(|h| TxHash::from_str(h).ok());
            if let Some((recipient, amount)) = claim_pair(&claim) {
                pool.take(recipient, amount, settled_by);
            }
        }

        // ========== MATCH ==========
        let mut failed = failed;
        failed.sort_by_key(|c| c.created_at);
        for claim in failed {
            let Some((recipient, amount)) = claim_pair(&claim) else {
                continue;
            };
            let Some(tx_hash) = pool.take(recipient, amount, None) else {
                continue;
            };

            let note = format!("reconciled: found settled on chain in {}", tx_hash);
            if self
                .store
                .reconcile_completed(claim.id, &tx_hash.to_string(), &note)
                .await?
            {
                report.recovered += 1;
                info!(claim_id = %claim.id, %tx_hash, "✓ Claim recovered from chain history");
            }
        }

        if report.recovered > 0 {
            warn!(
                recovered = report.recovered,
                scanned = report.failed_scanned,
                "⚠️ FAILED claims found settled on chain"
            );
        }
        Ok(report)
    }
}
