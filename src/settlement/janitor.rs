use std::sync::Arc;

use chrono::Duration;
use tracing::{error, info, warn};

use crate::error::AppResult;
use crate::ledger::ClaimStore;
use crate::notifications::Notifier;

/// Keeps claims from sitting in transient states.
pub struct LifecycleJanitor {
    store: Arc<dyn ClaimStore>,
    notifier: Notifier,
    processing_timeout: Duration,
    max_retries: i32,
    refund_batch_limit: i64,
}

impl LifecycleJanitor {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        notifier: Notifier,
        processing_timeout: Duration,
        max_retries: i32,
        refund_batch_limit: i64,
    ) -> Self {
        Self {
            store,
            notifier,
            processing_timeout,
            max_retries,
            refund_batch_limit,
        }
    }

    /// PROCESSING past the timeout → QUEUED. Claims with a broadcast
    /// transaction on record are left to the submission resolver.
    pub async fn reset_stuck(&self) -> AppResult<u64> {
        let reset = self
            .store
            .reset_stuck_processing(self.processing_timeout)
            .await?;
        if reset > 0 {
            warn!(
                reset,
                timeout_secs = self.processing_timeout.num_seconds(),
                "🔄 Reset claims stuck in processing"
            );
        }
        Ok(reset)
    }

    /// QUEUED claims that can never be batched → FAILED
    pub async fn quarantine_invalid(&self) -> AppResult<u64> {
        let moved = self.store.quarantine_invalid_queued(self.max_retries).await?;
        if moved > 0 {
            warn!(moved, "⚠️ Quarantined claims with missing recipient or amount");
        }
        Ok(moved)
    }

    /// Permanently fail exhausted claims and credit their amount back.
    ///
    /// Each refund is its own store transaction, so one failure leaves the
    /// rest of the pass intact and the claim is picked up again next cycle.
    pub async fn refund_exhausted(&self) -> AppResult<u64> {
        let exhausted = self
            .store
            .exhausted_unrefunded(self.max_retries, self.refund_batch_limit)
            .await?;

        let mut refunded = 0;
        for claim in exhausted {
            let note = format!(
                "permanently failed after {} retries; {} refunded to internal balance",
                claim.retry_count, claim.amount
            );
            match self
                .store
                .refund_permanently_failed(claim.id, self.max_retries, &note)
                .await
            {
                Ok(true) => {
                    refunded += 1;
                    info!(
                        claim_id = %claim.id,
                        user_id = %claim.user_id,
                        amount = %claim.amount,
                        "💰 Claim permanently failed and refunded"
                    );
                    if let Some(recipient) = claim.recipient_address.as_deref() {
                        self.notifier.notify(
                            recipient,
                            "Reward claim refunded",
                            &format!(
                                "Your claim of {} could not be settled and was returned to your balance.",
                                claim.amount
                            ),
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => error!(claim_id = %claim.id, error = %e, "❌ Refund failed"),
            }
        }

        Ok(refunded)
    }
}
