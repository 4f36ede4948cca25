// Scripted ledger for engine tests.
//
// Submissions are mined into a fresh block immediately unless the receipt
// mode says otherwise; errors can be queued per call kind.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use alloy::primitives::{address, keccak256, Address, TxHash, U256};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ChainBlock, ChainClient, ChainResult, ChainTransaction, TransferCall, TxReceipt};
use crate::error::ChainError;

pub const SIGNER: Address = address!("000000000000000000000000000000000000a11c");
pub const CONTRACT: Address = address!("00000000000000000000000000000000000d15c0");

/// What happens to a transaction after a successful submit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    Confirm,
    Revert,
    /// Accepted into the mempool but never mined
    Never,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub call: TransferCall,
    pub nonce: u64,
    pub gas_limit: u64,
    pub result: Result<TxHash, ChainError>,
}

struct State {
    pending_nonce: u64,
    pending_nonce_errors: VecDeque<ChainError>,
    balance: U256,
    fee: u128,
    gas_estimate: u64,
    submit_errors: VecDeque<ChainError>,
    receipt_errors: VecDeque<ChainError>,
    receipt_mode: ReceiptMode,
    submissions: Vec<Submission>,
    receipts: HashMap<TxHash, TxReceipt>,
    transactions: HashMap<TxHash, ChainTransaction>,
    blocks: BTreeMap<u64, ChainBlock>,
    head: u64,
    receipt_calls: usize,
}

pub struct MockChainClient {
    state: Mutex<State>,
    submit_delay: Duration,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending_nonce: 0,
                pending_nonce_errors: VecDeque::new(),
                balance: U256::from(10u64).pow(U256::from(18u64)),
                fee: 1_000_000_000,
                gas_estimate: 100_000,
                submit_errors: VecDeque::new(),
                receipt_errors: VecDeque::new(),
                receipt_mode: ReceiptMode::Confirm,
                submissions: Vec::new(),
                receipts: HashMap::new(),
                transactions: HashMap::new(),
                blocks: BTreeMap::new(),
                head: 100,
                receipt_calls: 0,
            }),
            submit_delay: Duration::ZERO,
        }
    }

    /// Hold every submit for `delay` to force pipelines to overlap
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn set_pending_nonce(&self, nonce: u64) {
        self.state.lock().pending_nonce = nonce;
    }

    pub fn fail_pending_nonce(&self, err: ChainError) {
        self.state.lock().pending_nonce_errors.push_back(err);
    }

    pub fn set_balance(&self, balance: U256) {
        self.state.lock().balance = balance;
    }

    pub fn set_fee(&self, fee: u128) {
        self.state.lock().fee = fee;
    }

    pub fn fail_next_submit(&self, err: ChainError) {
        self.state.lock().submit_errors.push_back(err);
    }

    pub fn fail_next_receipt(&self, err: ChainError) {
        self.state.lock().receipt_errors.push_back(err);
    }

    pub fn set_receipt_mode(&self, mode: ReceiptMode) {
        self.state.lock().receipt_mode = mode;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn accepted(&self) -> Vec<Submission> {
        self.submissions()
            .into_iter()
            .filter(|s| s.result.is_ok())
            .collect()
    }

    pub fn receipt_calls(&self) -> usize {
        self.state.lock().receipt_calls
    }

    /// Mine a successful transaction the engine never saw, as if a process
    /// crashed between submit and the status write
    pub fn mine_external(&self, from: Address, to: Address, call: &TransferCall) -> TxHash {
        let mut state = self.state.lock();
        let salt = state.transactions.len() as u64 + 1_000_000;
        let hash = tx_hash(salt, call);
        mine(&mut state, hash, from, to, call, true);
        hash
    }

    /// Let a transaction that was left unmined land now
    pub fn mine_pending(&self, hash: TxHash) {
        let mut state = self.state.lock();
        let Some(sub) = state
            .submissions
            .iter()
            .find(|s| s.result.as_ref().ok() == Some(&hash))
            .cloned()
        else {
            return;
        };
        mine(&mut state, hash, SIGNER, CONTRACT, &sub.call, true);
    }

    /// Evict an unmined transaction from the mempool
    pub fn drop_pending(&self, hash: TxHash) {
        let mut state = self.state.lock();
        if state
            .transactions
            .get(&hash)
            .is_some_and(|tx| tx.block_number.is_none())
        {
            state.transactions.remove(&hash);
        }
    }
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

fn tx_hash(nonce: u64, call: &TransferCall) -> TxHash {
    let mut preimage = nonce.to_be_bytes().to_vec();
    preimage.extend_from_slice(&call.encode());
    keccak256(preimage)
}

fn mine(state: &mut State, hash: TxHash, from: Address, to: Address, call: &TransferCall, success: bool) {
    state.head += 1;
    let number = state.head;
    let tx = ChainTransaction {
        hash,
        from,
        to: Some(to),
        input: call.encode(),
        block_number: Some(number),
    };
    state.transactions.insert(hash, tx.clone());
    state.blocks.insert(
        number,
        ChainBlock {
            number,
            transactions: vec![tx],
        },
    );
    state.receipts.insert(
        hash,
        TxReceipt {
            tx_hash: hash,
            block_number: Some(number),
            success,
            gas_used: 21_000 + 30_000 * call.len() as u64,
        },
    );
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn signer(&self) -> Address {
        SIGNER
    }

    fn dispatch_contract(&self) -> Address {
        CONTRACT
    }

    async fn pending_nonce(&self, _address: Address) -> ChainResult<u64> {
        let mut state = self.state.lock();
        match state.pending_nonce_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(state.pending_nonce),
        }
    }

    async fn latest_nonce(&self, _address: Address) -> ChainResult<u64> {
        Ok(self.state.lock().pending_nonce)
    }

    async fn estimate_gas(&self, call: &TransferCall) -> ChainResult<u64> {
        let base = self.state.lock().gas_estimate;
        Ok(base + 30_000 * call.len() as u64)
    }

    async fn submit(&self, call: &TransferCall, nonce: u64, gas_limit: u64) -> ChainResult<TxHash> {
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }

        let mut state = self.state.lock();
        let result = match state.submit_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(tx_hash(nonce, call)),
        };
        state.submissions.push(Submission {
            call: call.clone(),
            nonce,
            gas_limit,
            result: result.clone(),
        });

        let hash = result?;
        state.pending_nonce = state.pending_nonce.max(nonce + 1);
        match state.receipt_mode {
            ReceiptMode::Confirm => mine(&mut state, hash, SIGNER, CONTRACT, call, true),
            ReceiptMode::Revert => mine(&mut state, hash, SIGNER, CONTRACT, call, false),
            ReceiptMode::Never => {
                state.transactions.insert(
                    hash,
                    ChainTransaction {
                        hash,
                        from: SIGNER,
                        to: Some(CONTRACT),
                        input: call.encode(),
                        block_number: None,
                    },
                );
            }
        }
        Ok(hash)
    }

    async fn get_receipt(&self, tx_hash: TxHash) -> ChainResult<Option<TxReceipt>> {
        let mut state = self.state.lock();
        state.receipt_calls += 1;
        if let Some(err) = state.receipt_errors.pop_front() {
            return Err(err);
        }
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn get_transaction(&self, tx_hash: TxHash) -> ChainResult<Option<ChainTransaction>> {
        Ok(self.state.lock().transactions.get(&tx_hash).cloned())
    }

    async fn get_balance(&self, _address: Address) -> ChainResult<U256> {
        Ok(self.state.lock().balance)
    }

    async fn get_fee_estimate(&self) -> ChainResult<u128> {
        Ok(self.state.lock().fee)
    }

    async fn block_number(&self) -> ChainResult<u64> {
        Ok(self.state.lock().head)
    }

    async fn get_block(&self, number: u64) -> ChainResult<Option<ChainBlock>> {
        let state = self.state.lock();
        if number > state.head {
            return Ok(None);
        }
        Ok(Some(state.blocks.get(&number).cloned().unwrap_or(ChainBlock {
            number,
            transactions: Vec::new(),
        })))
    }
}
