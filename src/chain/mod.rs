// External ledger access for the settlement engine.
//
// The engine only talks to `ChainClient`; `evm` is the production client and
// `mock` a scripted one for tests.

pub mod evm;

#[cfg(test)]
pub mod mock;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;

use crate::error::ChainError;

pub type ChainResult<T> = Result<T, ChainError>;

sol! {
    /// Reward dispatch contract: one call pays many recipients
    interface IRewardDispatcher {
        function batchTransfer(address[] calldata recipients, uint256[] calldata amounts) external;
    }
}

/// One multi-recipient transfer, positionally paired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCall {
    pub recipients: Vec<Address>,
    pub amounts: Vec<U256>,
}

impl TransferCall {
    pub fn new() -> Self {
        Self {
            recipients: Vec::new(),
            amounts: Vec::new(),
        }
    }

    pub fn push(&mut self, recipient: Address, amount: U256) {
        self.recipients.push(recipient);
        self.amounts.push(amount);
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (Address, U256)> + '_ {
        self.recipients.iter().copied().zip(self.amounts.iter().copied())
    }

    pub fn encode(&self) -> Bytes {
        IRewardDispatcher::batchTransferCall {
            recipients: self.recipients.clone(),
            amounts: self.amounts.clone(),
        }
        .abi_encode()
        .into()
    }

    /// Decode dispatch calldata; anything else (other selectors, malformed
    /// input, mismatched array lengths) yields None
    pub fn decode(input: &[u8]) -> Option<Self> {
        let call = IRewardDispatcher::batchTransferCall::abi_decode(input).ok()?;
        if call.recipients.len() != call.amounts.len() {
            return None;
        }
        Some(Self {
            recipients: call.recipients,
            amounts: call.amounts,
        })
    }
}

impl Default for TransferCall {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    pub success: bool,
    pub gas_used: u64,
}

/// Transaction as seen in a block or by hash lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub number: u64,
    pub transactions: Vec<ChainTransaction>,
}

/// Ledger operations consumed by the settlement engine.
///
/// Implementations are stateless and shared across batch pipelines.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Admin signer address
    fn signer(&self) -> Address;

    /// Reward dispatch contract address
    fn dispatch_contract(&self) -> Address;

    /// Transaction count including mempool
    async fn pending_nonce(&self, address: Address) -> ChainResult<u64>;

    /// Transaction count as of the latest block
    async fn latest_nonce(&self, address: Address) -> ChainResult<u64>;

    async fn estimate_gas(&self, call: &TransferCall) -> ChainResult<u64>;

    /// Sign and broadcast. A node that already holds the identical signed
    /// transaction counts as accepted and yields its hash.
    async fn submit(&self, call: &TransferCall, nonce: u64, gas_limit: u64) -> ChainResult<TxHash>;

    async fn get_receipt(&self, tx_hash: TxHash) -> ChainResult<Option<TxReceipt>>;

    async fn get_transaction(&self, tx_hash: TxHash) -> ChainResult<Option<ChainTransaction>>;

    async fn get_balance(&self, address: Address) -> ChainResult<U256>;

    /// Current fee per gas unit, in wei
    async fn get_fee_estimate(&self) -> ChainResult<u128>;

    async fn block_number(&self) -> ChainResult<u64>;

    /// Block with full transaction bodies
    async fn get_block(&self, number: u64) -> ChainResult<Option<ChainBlock>>;

    fn decode_call(&self, input: &[u8]) -> Option<TransferCall> {
        TransferCall::decode(input)
    }

    /// Transactions from the signer to the dispatch contract within
    /// `from_block..=to_block`, with their decoded calls.
    ///
    /// The default walks every block; a client backed by an indexed history
    /// can answer this directly.
    async fn dispatch_history(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<(ChainTransaction, TransferCall)>> {
        let signer = self.signer();
        let contract = self.dispatch_contract();
        let mut found = Vec::new();

        for number in from_block..=to_block {
            let Some(block) = self.get_block(number).await? else {
                continue;
            };
            for tx in block.transactions {
                if tx.from != signer || tx.to != Some(contract) {
                    continue;
                }
                if let Some(call) = self.decode_call(&tx.input).filter(|c| !c.is_empty()) {
                    found.push((tx, call));
                }
            }
        }

        Ok(found)
    }
}
