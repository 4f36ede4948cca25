// Settlement cycle
//
// Order within one cycle:
// 1. janitor: reset stuck PROCESSING, quarantine invalid QUEUED
// 2. resolve claims still carrying an unresolved broadcast
// 3. reconcile recent on-chain history against FAILED claims
// 4. janitor: refund exhausted claims (after reconciliation, so a claim that
//    actually settled is never refunded)
// 5. signer capacity check for the whole cycle
// 6. pull eligible claims, carve batches, run pipelines concurrently under
//    the cycle deadline

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, instrument, warn, Instrument};

use super::confirmation::{Confirmation, ConfirmationPoller};
use super::gas_guard::GasGuard;
use super::janitor::LifecycleJanitor;
use super::nonce::NonceAllocator;
use super::reconciler::ReconciliationScanner;
use super::submitter::{BatchSubmission, BatchSubmitter, SubmittedBatch};
use crate::chain::ChainClient;
use crate::config::SettlementConfig;
use crate::error::{AppResult, SettlementError};
use crate::ledger::models::{Claim, ClaimStats};
use crate::ledger::ClaimStore;
use crate::notifications::Notifier;

/// Result of one settlement cycle, returned to the scheduler or caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub processed_count: usize,
    pub batches_run: usize,
    pub gas_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub reset_stuck: u64,
    pub quarantined: u64,
    /// Claims settled by a receipt that arrived after their pipeline gave up
    pub late_confirmed: usize,
    pub reconciled: usize,
    pub refunded: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct PipelineOutcome {
    submitted: bool,
    completed: usize,
}

/// One batch: submit, await confirmation, write the outcome
struct BatchPipeline {
    store: Arc<dyn ClaimStore>,
    nonces: Arc<NonceAllocator>,
    submitter: BatchSubmitter,
    poller: ConfirmationPoller,
    notifier: Notifier,
    signer: Address,
}

impl BatchPipeline {
    async fn run(&self, claims: Vec<Claim>) -> AppResult<PipelineOutcome> {
        let batch = match self.submitter.submit_batch(claims).await? {
            BatchSubmission::Submitted(batch) => batch,
            BatchSubmission::Empty | BatchSubmission::Rejected { .. } => {
                return Ok(PipelineOutcome::default())
            }
        };

        let confirmation = self.poller.await_confirmation(batch.tx_hash).await;
        let completed = self.settle(&batch, confirmation).await?;

        Ok(PipelineOutcome {
            submitted: true,
            completed,
        })
    }

    async fn settle(&self, batch: &SubmittedBatch, confirmation: Confirmation) -> AppResult<usize> {
        let ids = batch.claim_ids();
        let tx_hash = batch.tx_hash;

        match confirmation {
            Confirmation::Confirmed(receipt) => {
                let updated = self.store.mark_completed(&ids, &tx_hash.to_string()).await?;
                self.nonces.release(self.signer, batch.nonce).await;
                info!(
                    %tx_hash,
                    block = ?receipt.block_number,
                    claims = updated,
                    "✓ Batch settled"
                );

                for claim in &batch.claims {
                    if let Some(recipient) = claim.recipient_address.as_deref() {
                        self.notifier.notify(
                            recipient,
                            "Reward claim settled",
                            &format!("{} tokens were sent in transaction {}", claim.amount, tx_hash),
                        );
                    }
                }
                Ok(updated as usize)
            }
            Confirmation::Reverted(_) => {
                // mined, so the nonce is spent
                self.nonces.release(self.signer, batch.nonce).await;
                let reason = format!("transaction {} reverted on chain", tx_hash);
                self.store
                    .clear_submission(&ids, &tx_hash.to_string(), &reason)
                    .await?;
                // claims whose hash was never recorded
                self.store.mark_failed(&ids, &reason, &[]).await?;
                Ok(0)
            }
            // FAILED but still carrying the hash: neither retried nor refunded
            // until the transaction resolves
            Confirmation::TimedOut { attempts } => {
                // nonce stays reserved: the transaction may still land
                warn!(%tx_hash, nonce = batch.nonce, attempts, "⚠️ Batch unconfirmed, nonce held for reconciliation");
                self.store
                    .mark_failed(
                        &ids,
                        &format!(
                            "no receipt for {} after {} polls; left for reconciliation",
                            tx_hash, attempts
                        ),
                        &[],
                    )
                    .await?;
                Ok(0)
            }
            Confirmation::Unavailable(e) => {
                warn!(%tx_hash, nonce = batch.nonce, error = %e, "⚠️ Confirmation unavailable, nonce held for reconciliation");
                self.store
                    .mark_failed(
                        &ids,
                        &format!("confirmation of {} failed: {}", tx_hash, e),
                        &[],
                    )
                    .await?;
                Ok(0)
            }
        }
    }
}

/// Settlement engine - turns eligible claims into confirmed ledger transfers
pub struct SettlementEngine {
    store: Arc<dyn ClaimStore>,
    chain: Arc<dyn ChainClient>,
    nonces: Arc<NonceAllocator>,
    guard: GasGuard,
    reconciler: ReconciliationScanner,
    janitor: LifecycleJanitor,
    pipeline: Arc<BatchPipeline>,
    config: SettlementConfig,
    cycle_deadline: Duration,
    cycle_lock: Mutex<()>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        chain: Arc<dyn ChainClient>,
        notifier: Notifier,
        config: SettlementConfig,
    ) -> Self {
        let nonces = Arc::new(NonceAllocator::new(chain.clone()));

        let pipeline = Arc::new(BatchPipeline {
            store: store.clone(),
            nonces: nonces.clone(),
            submitter: BatchSubmitter::new(
                store.clone(),
                chain.clone(),
                nonces.clone(),
                config.max_retries,
            ),
            poller: ConfirmationPoller::new(
                chain.clone(),
                config.confirm_initial_interval(),
                config.confirm_attempts,
            ),
            notifier: notifier.clone(),
            signer: chain.signer(),
        });

        Self {
            guard: GasGuard::new(chain.clone(), &config),
            reconciler: ReconciliationScanner::new(
                store.clone(),
                chain.clone(),
                nonces.clone(),
                config.reconcile_lookback_blocks,
                config.reconcile_claim_limit,
            ),
            janitor: LifecycleJanitor::new(
                store.clone(),
                notifier,
                chrono::Duration::seconds(config.processing_timeout_secs),
                config.max_retries,
                config.refund_batch_limit,
            ),
            cycle_deadline: config.cycle_deadline(),
            store,
            chain,
            nonces,
            pipeline,
            config,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn with_cycle_deadline(mut self, deadline: Duration) -> Self {
        self.cycle_deadline = deadline;
        self
    }

    pub fn signer(&self) -> Address {
        self.chain.signer()
    }

    pub fn nonces(&self) -> &Arc<NonceAllocator> {
        &self.nonces
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub async fn stats(&self) -> AppResult<ClaimStats> {
        self.store.stats(self.config.max_retries).await
    }

    /// Run one settlement cycle. `force` runs it even when settlement is
    /// disabled by configuration.
    ///
    /// Only an overlapping cycle is an `Err`; everything that goes wrong
    /// inside the cycle is reported in the summary.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self, force: bool) -> AppResult<CycleSummary> {
        let _running = self
            .cycle_lock
            .try_lock()
            .map_err(|_| SettlementError::CycleInProgress)?;

        if !self.config.enabled && !force {
            info!("⏭️ Settlement disabled, skipping cycle");
            return Ok(CycleSummary {
                error: Some("settlement disabled".to_string()),
                ..CycleSummary::default()
            });
        }

        let started = Instant::now();
        info!("🔄 Starting settlement cycle");

        let mut summary = CycleSummary::default();
        if let Err(e) = self.run_stages(&mut summary).await {
            error!(error = %e, "❌ Settlement cycle aborted");
            summary.error = Some(e.to_string());
        }
        summary.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            processed = summary.processed_count,
            batches = summary.batches_run,
            gas_limited = summary.gas_limited,
            reconciled = summary.reconciled,
            refunded = summary.refunded,
            duration_ms = summary.duration_ms,
            "✓ Settlement cycle completed"
        );
        Ok(summary)
    }

    async fn run_stages(&self, summary: &mut CycleSummary) -> AppResult<()> {
        let cfg = &self.config;

        // ========== JANITOR ==========
        summary.reset_stuck = self.janitor.reset_stuck().await?;
        summary.quarantined = self.janitor.quarantine_invalid().await?;

        // ========== UNRESOLVED BROADCASTS ==========
        let stale_after = chrono::Duration::seconds(cfg.processing_timeout_secs);
        match self.reconciler.resolve_pending_submissions(stale_after).await {
            Ok(report) => summary.late_confirmed = report.confirmed,
            Err(e) => warn!(error = %e, "⚠️ Pending submissions not resolved this cycle"),
        }

        // ========== RECONCILIATION ==========
        match self.reconciler.reconcile_recent_failures().await {
            Ok(report) => summary.reconciled = report.recovered,
            Err(e) => warn!(error = %e, "⚠️ Reconciliation skipped this cycle"),
        }

        summary.refunded = self.janitor.refund_exhausted().await?;

        // ========== CAPACITY ==========
        let signer = self.chain.signer();
        let desired = cfg.max_batch_size * cfg.concurrency;
        let capacity = self
            .guard
            .check_capacity(signer, cfg.max_batch_size, cfg.concurrency)
            .await?;

        if !capacity.affordable {
            summary.gas_limited = true;
            error!(
                alert = "signer_underfunded",
                %signer,
                balance = %capacity.balance,
                required = %capacity.min_batch_cost,
                fee_per_gas = capacity.fee_per_gas,
                "❌ Signer cannot afford a single transfer, batch submission aborted"
            );
            return Err(SettlementError::SignerUnderfunded {
                signer: signer.to_string(),
                balance: capacity.balance.to_string(),
                required: capacity.min_batch_cost.to_string(),
            }
            .into());
        }
        summary.gas_limited = capacity.recommended_size < desired;

        // ========== PICKUP ==========
        let claims = self
            .store
            .fetch_eligible(
                capacity.recommended_size as i64,
                cfg.max_retries,
                chrono::Duration::seconds(cfg.retry_base_delay_secs),
            )
            .await?;
        if claims.is_empty() {
            info!("✓ No claims eligible for settlement");
            return Ok(());
        }

        // ========== FAN OUT ==========
        let batch_size = capacity.batch_size.max(1);
        let mut pipelines = JoinSet::new();
        for (idx, chunk) in claims.chunks(batch_size).take(capacity.batches).enumerate() {
            let pipeline = self.pipeline.clone();
            let chunk = chunk.to_vec();
            let span = info_span!("batch_pipeline", batch = idx, claims = chunk.len());
            pipelines.spawn(async move { pipeline.run(chunk).await }.instrument(span));
        }
        info!(
            claims = claims.len(),
            batches = pipelines.len(),
            batch_size,
            "📦 Batches dispatched"
        );

        let drained = tokio::time::timeout(self.cycle_deadline, async {
            while let Some(joined) = pipelines.join_next().await {
                match joined {
                    Ok(Ok(outcome)) => {
                        if outcome.submitted {
                            summary.batches_run += 1;
                        }
                        summary.processed_count += outcome.completed;
                    }
                    Ok(Err(e)) => error!(error = %e, "❌ Batch pipeline failed"),
                    Err(e) => error!(error = %e, "❌ Batch pipeline panicked"),
                }
            }
        })
        .await;

        if drained.is_err() {
            let abandoned = pipelines.len();
            pipelines.abort_all();
            warn!(
                abandoned,
                deadline_secs = self.cycle_deadline.as_secs(),
                "⚠️ Cycle deadline reached, unfinished batches left for the janitor"
            );
            summary.error = Some(format!(
                "cycle deadline reached with {} batches unfinished",
                abandoned
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{MockChainClient, ReceiptMode, SIGNER};
    use crate::error::{AppError, ChainError};
    use crate::ledger::memory::{queued_claim, MemoryClaimStore};
    use crate::ledger::models::{ClaimStatus, NewClaim};
    use alloy::primitives::U256;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;
    use uuid::Uuid;

    const ALICE: &str = "0x00000000000000000000000000000000000000aa";
    const BOB: &str = "0x00000000000000000000000000000000000000bb";

    fn test_config() -> SettlementConfig {
        SettlementConfig {
            max_batch_size: 2,
            concurrency: 3,
            retry_base_delay_secs: 0,
            confirm_initial_secs: 0,
            confirm_attempts: 3,
            reconcile_lookback_blocks: 100,
            ..SettlementConfig::default()
        }
    }

    fn engine(
        store: &Arc<MemoryClaimStore>,
        chain: &Arc<MockChainClient>,
        config: SettlementConfig,
    ) -> SettlementEngine {
        SettlementEngine::new(store.clone(), chain.clone(), Notifier::disabled(), config)
    }

    fn seed(store: &MemoryClaimStore, user: Uuid, amount: rust_decimal::Decimal, to: &str) -> Claim {
        let claim = queued_claim(user, amount, to);
        store.insert(claim.clone());
        claim
    }

    #[tokio::test]
    async fn test_single_claim_settles_in_one_poll() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        let engine = engine(&store, &chain, test_config());
        let claim = seed(&store, Uuid::new_v4(), dec!(100), ALICE);
        assert_eq!(claim.amount_atomic.as_deref(), Some("100000000000000000000"));

        let summary = engine.run_cycle(false).await.unwrap();

        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.batches_run, 1);
        assert!(summary.error.is_none());
        assert_eq!(chain.receipt_calls(), 1);

        let claim = store.claim(claim.id);
        assert_eq!(claim.status, ClaimStatus::Completed);
        assert!(!claim.batch_transaction_hash.unwrap_or_default().is_empty());
        assert!(engine.nonces().in_flight(SIGNER).await.is_empty());
    }

    #[tokio::test]
    async fn test_nonce_too_low_then_both_claims_share_one_hash() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        let engine = engine(&store, &chain, test_config());
        let user = Uuid::new_v4();
        let a = seed(&store, user, dec!(10), ALICE);
        let b = seed(&store, user, dec!(20), ALICE);
        chain.fail_next_submit(ChainError::NonceConflict("nonce too low".into()));

        let summary = engine.run_cycle(false).await.unwrap();
        assert_eq!(summary.processed_count, 2);

        let attempts = chain.submissions();
        assert_eq!(attempts.len(), 2);
        assert_ne!(attempts[0].nonce, attempts[1].nonce);

        let (a, b) = (store.claim(a.id), store.claim(b.id));
        assert_eq!(a.status, ClaimStatus::Completed);
        assert_eq!(b.status, ClaimStatus::Completed);
        assert!(a.batch_transaction_hash.is_some());
        assert_eq!(a.batch_transaction_hash, b.batch_transaction_hash);
    }

    #[tokio::test]
    async fn test_exhausted_retries_refund_exactly_once() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        chain.set_receipt_mode(ReceiptMode::Revert);
        let engine = engine(&store, &chain, test_config());

        let user = Uuid::new_v4();
        store.set_balance(user, dec!(100));
        let claim = store
            .create_claim(
                NewClaim {
                    user_id: user,
                    amount: dec!(100),
                    amount_atomic: "100000000000000000000".to_string(),
                    recipient_address: ALICE.to_string(),
                },
                3,
            )
            .await
            .unwrap();
        assert_eq!(store.balance(user), dec!(0));

        for _ in 0..6 {
            engine.run_cycle(false).await.unwrap();
        }

        // first attempt plus three retries, every one rejected
        assert_eq!(chain.accepted().len(), 4);
        let claim = store.claim(claim.id);
        assert_eq!(claim.status, ClaimStatus::Failed);
        assert_eq!(claim.retry_count, 3);
        assert!(claim.permanently_failed_at.is_some());
        assert_eq!(store.balance(user), dec!(100));
    }

    #[tokio::test]
    async fn test_concurrent_batches_never_share_a_nonce() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new().with_submit_delay(Duration::from_millis(20)));
        let engine = engine(&store, &chain, test_config());
        for _ in 0..6 {
            seed(&store, Uuid::new_v4(), dec!(1), BOB);
        }

        let summary = engine.run_cycle(false).await.unwrap();
        assert_eq!(summary.batches_run, 3);
        assert_eq!(summary.processed_count, 6);

        let nonces: HashSet<u64> = chain.accepted().iter().map(|s| s.nonce).collect();
        assert_eq!(nonces.len(), 3);
    }

    #[tokio::test]
    async fn test_batches_respect_signer_capacity() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        let config = SettlementConfig {
            max_batch_size: 10,
            concurrency: 1,
            gas_per_recipient: 50_000,
            base_gas: 100_000,
            balance_safety_percent: 100,
            ..test_config()
        };
        // 1 gwei fee: base 100_000 gwei + 2 × 50_000 gwei fits exactly
        chain.set_fee(1_000_000_000);
        chain.set_balance(U256::from(200_000u128 * 1_000_000_000));
        let engine = engine(&store, &chain, config);
        for _ in 0..5 {
            seed(&store, Uuid::new_v4(), dec!(1), ALICE);
        }

        let summary = engine.run_cycle(false).await.unwrap();

        assert!(summary.gas_limited);
        assert_eq!(summary.processed_count, 2);
        assert!(chain.accepted().iter().all(|s| s.call.len() <= 2));
    }

    #[tokio::test]
    async fn test_concurrent_batches_fit_the_signer_balance_together() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        let config = SettlementConfig {
            max_batch_size: 2,
            concurrency: 3,
            gas_per_recipient: 50_000,
            base_gas: 100_000,
            balance_safety_percent: 100,
            ..test_config()
        };
        let gwei = 1_000_000_000u128;
        chain.set_fee(gwei);
        chain.set_balance(U256::from(400_000u128 * gwei));
        let engine = engine(&store, &chain, config);
        for _ in 0..6 {
            seed(&store, Uuid::new_v4(), dec!(1), BOB);
        }

        let summary = engine.run_cycle(false).await.unwrap();

        assert!(summary.gas_limited);
        assert_eq!(summary.batches_run, 2);
        assert_eq!(summary.processed_count, 4);
        let worst_case: u128 = chain
            .accepted()
            .iter()
            .map(|s| (100_000 + 50_000 * s.call.len() as u128) * gwei)
            .sum();
        assert!(worst_case <= 400_000 * gwei);
    }

    #[tokio::test]
    async fn test_underfunded_signer_aborts_without_touching_claims() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        chain.set_balance(U256::ZERO);
        let engine = engine(&store, &chain, test_config());
        let claim = seed(&store, Uuid::new_v4(), dec!(1), ALICE);

        let summary = engine.run_cycle(false).await.unwrap();

        assert!(summary.gas_limited);
        assert!(summary.error.unwrap().contains("cannot afford"));
        assert!(chain.submissions().is_empty());
        assert_eq!(store.claim(claim.id).status, ClaimStatus::Queued);
    }

    #[tokio::test]
    async fn test_timed_out_batch_is_recovered_next_cycle() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        chain.set_receipt_mode(ReceiptMode::Never);
        let config = SettlementConfig {
            retry_base_delay_secs: 3600,
            ..test_config()
        };
        let engine = engine(&store, &chain, config);
        let claim = seed(&store, Uuid::new_v4(), dec!(1), ALICE);

        engine.run_cycle(false).await.unwrap();
        assert_eq!(store.claim(claim.id).status, ClaimStatus::Failed);
        assert_eq!(engine.nonces().in_flight(SIGNER).await.len(), 1);

        let hash = chain.accepted()[0].result.clone().unwrap();
        chain.mine_pending(hash);

        let summary = engine.run_cycle(false).await.unwrap();
        assert_eq!(summary.late_confirmed, 1);
        assert_eq!(store.claim(claim.id).status, ClaimStatus::Completed);
        assert!(engine.nonces().in_flight(SIGNER).await.is_empty());
        assert_eq!(chain.accepted().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_claim_with_pending_transaction_is_not_refunded() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        chain.set_receipt_mode(ReceiptMode::Never);
        let engine = engine(&store, &chain, test_config());

        let user = Uuid::new_v4();
        let claim = seed(&store, user, dec!(4), ALICE);
        // last retry left
        store.update(claim.id, |c| {
            c.status = ClaimStatus::Failed;
            c.retry_count = 2;
        });

        engine.run_cycle(false).await.unwrap();
        let after_timeout = store.claim(claim.id);
        assert_eq!(after_timeout.status, ClaimStatus::Failed);
        assert_eq!(after_timeout.retry_count, 3);
        assert!(after_timeout.awaits_receipt());

        let summary = engine.run_cycle(false).await.unwrap();
        assert_eq!(summary.refunded, 0);
        assert!(store.claim(claim.id).permanently_failed_at.is_none());
        assert_eq!(store.balance(user), dec!(0));

        // the original transaction lands after all
        let hash = chain.accepted()[0].result.clone().unwrap();
        chain.mine_pending(hash);
        let summary = engine.run_cycle(false).await.unwrap();

        assert_eq!(summary.late_confirmed, 1);
        assert_eq!(summary.refunded, 0);
        let claim = store.claim(claim.id);
        assert_eq!(claim.status, ClaimStatus::Completed);
        assert_eq!(claim.batch_transaction_hash, Some(hash.to_string()));
        assert!(claim.permanently_failed_at.is_none());
        assert_eq!(store.balance(user), dec!(0));
        assert_eq!(chain.accepted().len(), 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_claim_is_not_resubmitted_under_a_new_nonce() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        chain.set_receipt_mode(ReceiptMode::Never);
        let engine = engine(&store, &chain, test_config());
        let claim = seed(&store, Uuid::new_v4(), dec!(1), ALICE);

        for _ in 0..3 {
            engine.run_cycle(false).await.unwrap();
        }

        let accepted = chain.accepted();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].nonce, 0);
        assert!(store.claim(claim.id).awaits_receipt());
        assert_eq!(engine.stats().await.unwrap().awaiting_receipt, 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_makes_claim_retryable() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        chain.set_receipt_mode(ReceiptMode::Never);
        let engine = engine(&store, &chain, test_config());
        let claim = seed(&store, Uuid::new_v4(), dec!(1), ALICE);

        engine.run_cycle(false).await.unwrap();
        let hash = chain.accepted()[0].result.clone().unwrap();

        chain.drop_pending(hash);
        engine
            .nonces()
            .abandon_older_than(SIGNER, Duration::ZERO)
            .await;
        chain.set_receipt_mode(ReceiptMode::Confirm);

        let summary = engine.run_cycle(false).await.unwrap();
        assert_eq!(summary.processed_count, 1);

        let claim = store.claim(claim.id);
        assert_eq!(claim.status, ClaimStatus::Completed);
        assert_ne!(claim.batch_transaction_hash, Some(hash.to_string()));
        assert_eq!(chain.accepted().len(), 2);
    }

    #[tokio::test]
    async fn test_stuck_claim_is_reset_and_settled() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        let engine = engine(&store, &chain, test_config());
        let claim = seed(&store, Uuid::new_v4(), dec!(1), ALICE);
        store.update(claim.id, |c| {
            c.status = ClaimStatus::Processing;
            c.updated_at = Utc::now() - chrono::Duration::hours(2);
        });

        let summary = engine.run_cycle(false).await.unwrap();

        assert_eq!(summary.reset_stuck, 1);
        assert_eq!(store.claim(claim.id).status, ClaimStatus::Completed);
    }

    #[tokio::test]
    async fn test_deadline_leaves_claims_processing() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        chain.set_receipt_mode(ReceiptMode::Never);
        let config = SettlementConfig {
            confirm_initial_secs: 5,
            ..test_config()
        };
        let engine = engine(&store, &chain, config).with_cycle_deadline(Duration::from_millis(50));
        let claim = seed(&store, Uuid::new_v4(), dec!(1), ALICE);

        let summary = engine.run_cycle(false).await.unwrap();

        assert!(summary.error.unwrap().contains("deadline"));
        assert_eq!(store.claim(claim.id).status, ClaimStatus::Processing);
    }

    #[tokio::test]
    async fn test_overlapping_cycles_are_rejected() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new().with_submit_delay(Duration::from_millis(20)));
        let engine = engine(&store, &chain, test_config());
        seed(&store, Uuid::new_v4(), dec!(1), ALICE);

        let (first, second) = tokio::join!(engine.run_cycle(false), engine.run_cycle(false));

        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(AppError::Settlement(SettlementError::CycleInProgress))
        ));
    }

    #[tokio::test]
    async fn test_disabled_engine_only_runs_when_forced() {
        let store = Arc::new(MemoryClaimStore::new());
        let chain = Arc::new(MockChainClient::new());
        let config = SettlementConfig {
            enabled: false,
            ..test_config()
        };
        let engine = engine(&store, &chain, config);
        seed(&store, Uuid::new_v4(), dec!(1), ALICE);

        let skipped = engine.run_cycle(false).await.unwrap();
        assert_eq!(skipped.processed_count, 0);
        assert!(chain.submissions().is_empty());

        let forced = engine.run_cycle(true).await.unwrap();
        assert_eq!(forced.processed_count, 1);
    }
}
