// Signer balance vs. the cost of one cycle's batches.
//
// Evaluated fresh every cycle; fee markets move and every batch spends gas.
// Each batch pays its own base cost, so the plan prices the batch count and
// the recipient count together.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use tracing::{debug, warn};

use crate::chain::{ChainClient, ChainResult};
use crate::config::SettlementConfig;

/// What the signer can pay for this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capacity {
    pub affordable: bool,
    /// Total recipients across all batches
    pub recommended_size: usize,
    /// Recipients per batch
    pub batch_size: usize,
    pub batches: usize,
    pub balance: U256,
    pub fee_per_gas: u128,
    /// Worst-case wei for a batch of one
    pub min_batch_cost: U256,
}

pub struct GasGuard {
    chain: Arc<dyn ChainClient>,
    gas_per_recipient: u64,
    base_gas: u64,
    safety_percent: u64,
}

impl GasGuard {
    pub fn new(chain: Arc<dyn ChainClient>, config: &SettlementConfig) -> Self {
        Self {
            chain,
            gas_per_recipient: config.gas_per_recipient,
            base_gas: config.base_gas,
            safety_percent: config.balance_safety_percent,
        }
    }

    pub async fn check_capacity(
        &self,
        signer: Address,
        max_batch_size: usize,
        max_batches: usize,
    ) -> ChainResult<Capacity> {
        let balance = self.chain.get_balance(signer).await?;
        let fee_per_gas = self.chain.get_fee_estimate().await?;

        let capacity = self.capacity_for(balance, fee_per_gas, max_batch_size, max_batches);
        let desired = max_batch_size * max_batches;
        if capacity.affordable && capacity.recommended_size < desired {
            warn!(
                %signer,
                %balance,
                fee_per_gas,
                desired,
                recommended = capacity.recommended_size,
                batches = capacity.batches,
                "⚠️ Signer balance limits this cycle"
            );
        } else {
            debug!(%signer, %balance, fee_per_gas, desired, "capacity checked");
        }
        Ok(capacity)
    }

    /// Batch count and recipient total whose combined worst-case cost,
    /// `batches × base + recipients × per_recipient`, fits in the usable share
    /// of `balance`. Prefers more recipients, then fewer batches.
    pub fn capacity_for(
        &self,
        balance: U256,
        fee_per_gas: u128,
        max_batch_size: usize,
        max_batches: usize,
    ) -> Capacity {
        let fee = U256::from(fee_per_gas);
        let per_recipient = fee * U256::from(self.gas_per_recipient);
        let base = fee * U256::from(self.base_gas);
        let min_batch_cost = base + per_recipient;

        let usable = balance * U256::from(self.safety_percent) / U256::from(100u64);

        let mut best = (0usize, 0usize);
        for batches in 1..=max_batches {
            let fixed = base * U256::from(batches);
            if usable < fixed + per_recipient {
                break;
            }
            let ceiling = max_batch_size * batches;
            let recipients = if per_recipient.is_zero() {
                ceiling
            } else {
                let fits: usize = ((usable - fixed) / per_recipient).saturating_to();
                fits.min(ceiling)
            };
            if recipients > best.0 {
                best = (recipients, batches);
            }
        }

        let (recommended_size, batches) = best;
        Capacity {
            affordable: recommended_size > 0,
            recommended_size,
            batch_size: if batches == 0 {
                0
            } else {
                recommended_size.div_ceil(batches)
            },
            batches,
            balance,
            fee_per_gas,
            min_batch_cost,
        }
    }
}
