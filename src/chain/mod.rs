//! Chain connectors
//!
//! This module provides the per-chain I/O the binders rely on:
//! - UTXO chains: unspent output lookup, raw transaction broadcast,
//!   transaction and address history lookup, confirmation counts
//! - Account chains: signed transaction submission, read-only calls,
//!   receipts and balances, with multi-RPC failover

pub mod esplora;
pub mod ethereum;

pub use esplora::EsploraClient;
pub use ethereum::EthereumProvider;

use async_trait::async_trait;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Transaction, Txid};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as AccountAddress, Bytes, TransactionReceipt, H256, U256};
use thiserror::Error;

/// Connector failures. Everything except `Invalid` is worth retrying.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("RPC error on {chain}: {message}")]
    Rpc { chain: String, message: String },

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid connector configuration: {0}")]
    Invalid(String),
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectorError::Invalid(_) | ConnectorError::Signing(_))
    }
}

/// Spendable output owned by an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
}

/// Read and broadcast access to a UTXO chain
#[async_trait]
pub trait UtxoConnector: Send + Sync {
    async fn unspent_outputs(&self, address: &Address) -> Result<Vec<Utxo>, ConnectorError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ConnectorError>;

    async fn transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ConnectorError>;

    /// Transactions paying to or spending from `address`, mempool included
    async fn address_transactions(
        &self,
        address: &Address,
    ) -> Result<Vec<Transaction>, ConnectorError>;

    /// Zero while unconfirmed or unknown
    async fn confirmations(&self, txid: &Txid) -> Result<u32, ConnectorError>;
}

/// Signing and read access to an account chain
#[async_trait]
pub trait AccountConnector: Send + Sync {
    /// Address transactions are sent from
    fn address(&self) -> AccountAddress;

    /// Fill nonce and gas price, sign with the chain wallet and submit
    async fn send_transaction(&self, tx: TypedTransaction) -> Result<H256, ConnectorError>;

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ConnectorError>;

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ConnectorError>;

    async fn balance(&self) -> Result<U256, ConnectorError>;

    /// EIP-191 personal-message signature by the chain wallet
    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, ConnectorError>;
}
