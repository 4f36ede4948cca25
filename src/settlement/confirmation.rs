// Confirmation poller: exponential backoff on the receipt, with a lookup by
// hash as a second path once the node has started failing.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::TxHash;
use tracing::{debug, info, instrument, warn};

use crate::chain::{ChainClient, TxReceipt};
use crate::error::ChainError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed(TxReceipt),
    /// Mined with a failed status; definitive
    Reverted(TxReceipt),
    /// No receipt within the attempt ceiling. The transaction may still land.
    TimedOut { attempts: u32 },
    /// The node returned a non-transient error
    Unavailable(ChainError),
}

pub struct ConfirmationPoller {
    chain: Arc<dyn ChainClient>,
    initial_interval: Duration,
    max_attempts: u32,
}

impl ConfirmationPoller {
    pub fn new(chain: Arc<dyn ChainClient>, initial_interval: Duration, max_attempts: u32) -> Self {
        Self {
            chain,
            initial_interval,
            max_attempts,
        }
    }

    #[instrument(skip(self), fields(%tx_hash))]
    pub async fn await_confirmation(&self, tx_hash: TxHash) -> Confirmation {
        let mut interval = self.initial_interval;

        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(interval).await;
            interval = interval.saturating_mul(2);

            let receipt = match self.chain.get_receipt(tx_hash).await {
                Ok(receipt) => receipt,
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "⚠️ Receipt poll failed");
                    if attempt > 1 {
                        self.lookup_by_hash(tx_hash).await
                    } else {
                        None
                    }
                }
                Err(e) => return Confirmation::Unavailable(e),
            };

            match receipt {
                Some(r) if r.success => {
                    info!(attempt, block = ?r.block_number, gas_used = r.gas_used, "✓ Transaction confirmed");
                    return Confirmation::Confirmed(r);
                }
                Some(r) => {
                    warn!(attempt, block = ?r.block_number, "❌ Transaction reverted");
                    return Confirmation::Reverted(r);
                }
                None => debug!(attempt, "receipt not yet available"),
            }
        }

        warn!(attempts = self.max_attempts, "⚠️ No receipt within attempt ceiling");
        Confirmation::TimedOut {
            attempts: self.max_attempts,
        }
    }

    /// Secondary path: if the transaction is known to be mined, fetch the
    /// receipt once more
    async fn lookup_by_hash(&self, tx_hash: TxHash) -> Option<TxReceipt> {
        match self.chain.get_transaction(tx_hash).await {
            Ok(Some(tx)) if tx.block_number.is_some() => {
                self.chain.get_receipt(tx_hash).await.ok().flatten()
            }
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "lookup by hash failed");
                None
            }
        }
    }
}
