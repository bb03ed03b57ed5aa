//! Account-chain connector with multi-RPC support and automatic failover

use super::{AccountConnector, ConnectorError};
use crate::config::AccountChainConfig;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP providers for one account chain plus the wallet that signs for it
pub struct EthereumProvider {
    chain: String,
    chain_id: u64,
    gas_price: Option<U256>,
    providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
    wallet: LocalWallet,
    /// Held across nonce lookup and submission so concurrent swaps don't reuse a nonce
    send_lock: Mutex<()>,
}

impl EthereumProvider {
    /// Create providers for every configured RPC URL; invalid URLs are skipped
    pub fn new(
        chain: &str,
        config: &AccountChainConfig,
        wallet: LocalWallet,
    ) -> Result<Self, ConnectorError> {
        let mut providers = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for {}: {}", chain, url);
                }
                Err(e) => warn!("Failed to create provider for {}: {}", url, e),
            }
        }

        if providers.is_empty() {
            return Err(ConnectorError::Invalid(format!(
                "no valid RPC providers for {}",
                chain
            )));
        }

        let wallet = wallet.with_chain_id(config.chain_id);
        info!("{} connector ready for {:?}", chain, wallet.address());

        Ok(Self {
            chain: chain.to_string(),
            chain_id: config.chain_id,
            gas_price: config
                .gas_price_gwei
                .map(|gwei| U256::from(gwei) * U256::exp10(9)),
            providers,
            current_provider: AtomicUsize::new(0),
            wallet,
            send_lock: Mutex::new(()),
        })
    }

    /// Current provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    /// Switch to the next provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("{} failover to provider {}", self.chain, next);
    }

    fn rpc_error(&self, message: impl ToString) -> ConnectorError {
        ConnectorError::Rpc {
            chain: self.chain.clone(),
            message: message.to_string(),
        }
    }

    /// Run `op` against each provider in turn until one answers
    async fn with_failover<T, F, Fut>(&self, op: F) -> Result<T, ConnectorError>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;
        for _ in 0..self.providers.len() {
            match op(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("RPC call on {} failed: {}", self.chain, e);
                    last_error = Some(e.to_string());
                    self.failover();
                }
            }
        }
        Err(self.rpc_error(last_error.unwrap_or_else(|| "all providers failed".to_string())))
    }

    /// Configured gas price, or the node's suggestion
    async fn current_gas_price(&self) -> Result<U256, ConnectorError> {
        match self.gas_price {
            Some(price) => Ok(price),
            None => {
                self.with_failover(|p| async move { p.get_gas_price().await })
                    .await
            }
        }
    }
}

#[async_trait]
impl AccountConnector for EthereumProvider {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Fill, sign and submit `tx`; only one submission per wallet is in flight
    async fn send_transaction(&self, mut tx: TypedTransaction) -> Result<H256, ConnectorError> {
        let _guard = self.send_lock.lock().await;

        let from = self.wallet.address();
        let nonce = self
            .with_failover(|p| async move {
                p.get_transaction_count(from, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;
        let gas_price = self.current_gas_price().await?;

        tx.set_from(from);
        tx.set_nonce(nonce);
        tx.set_gas_price(gas_price);
        tx.set_chain_id(self.chain_id);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| ConnectorError::Signing(e.to_string()))?;
        let signed = tx.rlp_signed(&signature);

        match timeout(SEND_TIMEOUT, self.http().send_raw_transaction(signed)).await {
            Ok(Ok(pending)) => {
                let hash = pending.tx_hash();
                info!("Transaction sent on {}: {:?} (nonce {})", self.chain, hash, nonce);
                Ok(hash)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if message.contains("insufficient funds") || message.contains("nonce too low") {
                    Err(ConnectorError::Rejected(message))
                } else {
                    self.failover();
                    Err(self.rpc_error(message))
                }
            }
            Err(_) => {
                self.failover();
                Err(ConnectorError::Timeout("send transaction".to_string()))
            }
        }
    }

    /// Read-only call against the latest block
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ConnectorError> {
        self.with_failover(|p| {
            let tx = tx.clone();
            async move { p.call(&tx, None).await }
        })
        .await
    }

    /// Receipt for `hash`, or `None` while pending
    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ConnectorError> {
        self.with_failover(|p| async move { p.get_transaction_receipt(hash).await })
            .await
    }

    /// Wallet balance in wei
    async fn balance(&self) -> Result<U256, ConnectorError> {
        let address = self.wallet.address();
        self.with_failover(|p| async move { p.get_balance(address, None).await })
            .await
    }

    /// Sign `message` with the chain wallet
    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        let signature = self
            .wallet
            .sign_message(message)
            .await
            .map_err(|e| ConnectorError::Signing(e.to_string()))?;
        Ok(signature.to_vec())
    }
}
