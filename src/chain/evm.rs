//! EVM implementation of [`ChainClient`] on an Alloy HTTP provider.
//!
//! The provider carries the admin wallet; nonce and gas limit are always set
//! explicitly by the settlement engine, so the provider's own fillers only
//! supply chain id and fee fields. Transactions are signed locally before
//! broadcast, so their hash is known even when the node answers "already
//! known".

use alloy::network::{EthereumWallet, TransactionBuilder, TransactionResponse};
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::fillers::{FillProvider, JoinFill, RecommendedFillers, WalletFiller};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider, SendableTx};
use alloy::rpc::types::{BlockNumberOrTag, Transaction, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{ChainBlock, ChainClient, ChainResult, ChainTransaction, TransferCall, TxReceipt};
use crate::config::LedgerConfig;
use crate::error::{AppError, AppResult, ChainError};

type EvmProvider = FillProvider<
    JoinFill<JoinFill<Identity, <alloy::network::Ethereum as RecommendedFillers>::RecommendedFillers>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

pub struct EvmChainClient {
    provider: EvmProvider,
    wallet: EthereumWallet,
    signer: Address,
    dispatch_contract: Address,
}

impl EvmChainClient {
    pub fn try_new(config: &LedgerConfig) -> AppResult<Self> {
        let signer: PrivateKeySigner = config
            .admin_private_key
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid admin private key: {}", e)))?;
        let signer_address = signer.address();

        let dispatch_contract: Address = config
            .dispatch_contract
            .trim()
            .parse()
            .map_err(|e| AppError::InvalidAddress(format!("Invalid dispatch contract: {}", e)))?;

        let rpc_url = config
            .rpc_url
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid RPC URL: {}", e)))?;

        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet.clone())
            .connect_http(rpc_url);

        info!(
            signer = %signer_address,
            dispatch_contract = %dispatch_contract,
            rpc = %config.rpc_url,
            "✅ EVM ledger client initialized"
        );

        Ok(Self {
            provider,
            wallet,
            signer: signer_address,
            dispatch_contract,
        })
    }

    fn request(&self, call: &TransferCall) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.signer)
            .with_to(self.dispatch_contract)
            .with_input(call.encode())
    }
}

/// Transport failures are network-class; everything else is classified by
/// the node's message.
fn rpc_error(err: RpcError<TransportErrorKind>) -> ChainError {
    match &err {
        RpcError::Transport(_) => ChainError::Network(err.to_string()),
        _ => ChainError::from_rpc_message(err.to_string()),
    }
}

/// A node that already holds the exact signed transaction has accepted it,
/// so the broadcast counts as submitted under the locally computed hash.
fn broadcast_outcome(sent: ChainResult<TxHash>, signed_hash: TxHash) -> ChainResult<TxHash> {
    match sent {
        Err(ChainError::AlreadyKnown(msg)) => {
            warn!(tx_hash = %signed_hash, node = %msg, "⚠️ Transaction already in mempool, treating as submitted");
            Ok(signed_hash)
        }
        other => other,
    }
}

fn to_chain_transaction(tx: &Transaction) -> ChainTransaction {
    ChainTransaction {
        hash: TransactionResponse::tx_hash(tx),
        from: TransactionResponse::from(tx),
        to: alloy::consensus::Transaction::to(tx),
        input: alloy::consensus::Transaction::input(tx).clone(),
        block_number: TransactionResponse::block_number(tx),
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn signer(&self) -> Address {
        self.signer
    }

    fn dispatch_contract(&self) -> Address {
        self.dispatch_contract
    }

    async fn pending_nonce(&self, address: Address) -> ChainResult<u64> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(rpc_error)
    }

    async fn latest_nonce(&self, address: Address) -> ChainResult<u64> {
        self.provider
            .get_transaction_count(address)
            .latest()
            .await
            .map_err(rpc_error)
    }

    #[instrument(skip(self, call), fields(recipients = call.len()))]
    async fn estimate_gas(&self, call: &TransferCall) -> ChainResult<u64> {
        let gas = self
            .provider
            .estimate_gas(self.request(call))
            .await
            .map_err(rpc_error)?;
        debug!(gas, "gas estimated");
        Ok(gas)
    }

    #[instrument(skip(self, call), fields(recipients = call.len()))]
    async fn submit(&self, call: &TransferCall, nonce: u64, gas_limit: u64) -> ChainResult<TxHash> {
        let tx = self
            .request(call)
            .with_nonce(nonce)
            .with_gas_limit(gas_limit);

        let envelope = match self.provider.fill(tx).await.map_err(rpc_error)? {
            SendableTx::Envelope(envelope) => envelope,
            SendableTx::Builder(request) => request
                .build(&self.wallet)
                .await
                .map_err(|e| ChainError::Rpc(format!("failed to sign transaction: {}", e)))?,
        };
        let signed_hash = *envelope.tx_hash();

        let sent = self
            .provider
            .send_tx_envelope(envelope)
            .await
            .map(|pending| *pending.tx_hash())
            .map_err(rpc_error);
        broadcast_outcome(sent, signed_hash)
    }

    async fn get_receipt(&self, tx_hash: TxHash) -> ChainResult<Option<TxReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(rpc_error)?;

        Ok(receipt.map(|r| TxReceipt {
            tx_hash: r.transaction_hash,
            block_number: r.block_number,
            success: r.status(),
            gas_used: r.gas_used,
        }))
    }

    async fn get_transaction(&self, tx_hash: TxHash) -> ChainResult<Option<ChainTransaction>> {
        let tx = self
            .provider
            .get_transaction_by_hash(tx_hash)
            .await
            .map_err(rpc_error)?;

        Ok(tx.as_ref().map(to_chain_transaction))
    }

    async fn get_balance(&self, address: Address) -> ChainResult<U256> {
        self.provider.get_balance(address).await.map_err(rpc_error)
    }

    async fn get_fee_estimate(&self) -> ChainResult<u128> {
        self.provider.get_gas_price().await.map_err(rpc_error)
    }

    async fn block_number(&self) -> ChainResult<u64> {
        self.provider.get_block_number().await.map_err(rpc_error)
    }

    async fn get_block(&self, number: u64) -> ChainResult<Option<ChainBlock>> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .full()
            .await
            .map_err(rpc_error)?;

        Ok(block.map(|b| ChainBlock {
            number: b.header.number,
            transactions: b
                .transactions
                .as_transactions()
                .map(|txs| txs.iter().map(to_chain_transaction).collect())
                .unwrap_or_default(),
        }))
    }
}
