//! Swap-contract binder for account chains

use super::{poll, Atom, AtomError, AuditReport};
use crate::chain::AccountConnector;
use crate::clock::Clock;
use crate::config::AccountChainConfig;
use crate::script::contract::{decode_bool, decode_bytes32};
use crate::script::{ContractAudit, Secret, SecretHash, SwapCall};
use crate::OrderId;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256, U64};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RECEIPT_POLLS: u32 = 120;

/// Locates a swap inside the chain's swap contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDetails {
    pub contract: Address,
    #[serde(with = "hex::serde")]
    pub swap_id: [u8; 32],
}

pub struct AccountAtom {
    chain: String,
    priority_code: u32,
    contract: Address,
    gas_limit: U256,
    instant_receipts: bool,
    poll_interval: Duration,
    swap_id: OrderId,
    connector: Arc<dyn AccountConnector>,
    clock: Arc<dyn Clock>,
    details: RwLock<Option<AccountDetails>>,
}

impl AccountAtom {
    pub fn new(
        chain: &str,
        config: &AccountChainConfig,
        contract: Address,
        swap_id: OrderId,
        connector: Arc<dyn AccountConnector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            priority_code: config.priority_code,
            contract,
            gas_limit: U256::from(config.gas_limit),
            instant_receipts: config.instant_receipts,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            swap_id,
            connector,
            clock,
            details: RwLock::new(None),
        }
    }

    /// Details of a loaded contract at the configured address
    fn loaded(&self) -> Result<AccountDetails, AtomError> {
        let details = self.details.read().clone().ok_or(AtomError::NotLoaded)?;
        if details.contract != self.contract {
            return Err(AtomError::MalformedContract(format!(
                "swap contract {:?} is not {:?}",
                details.contract, self.contract
            )));
        }
        Ok(details)
    }

    async fn query(&self, call: SwapCall) -> Result<Bytes, AtomError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.contract)
            .data(call.encode())
            .into();
        Ok(self.connector.call(&tx).await?)
    }

    async fn flag(&self, call: SwapCall) -> Result<bool, AtomError> {
        Ok(decode_bool(&self.query(call).await?)?)
    }

    /// Send a contract call and wait for a successful receipt
    async fn transact(&self, call: SwapCall, value: U256) -> Result<H256, AtomError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.contract)
            .data(call.encode())
            .value(value)
            .gas(self.gas_limit)
            .into();

        let hash = self.connector.send_transaction(tx).await?;
        debug!("{}: sent {:?}, waiting for receipt", self.chain, hash);

        let attempts = if self.instant_receipts { 1 } else { RECEIPT_POLLS };
        let connector = &self.connector;
        let receipt = poll(self.poll_interval, attempts, || async move {
            Ok(connector.transaction_receipt(hash).await?)
        })
        .await?
        .ok_or_else(|| AtomError::Unconfirmed(format!("{:?}", hash)))?;

        if receipt.status != Some(U64::one()) {
            warn!("{}: transaction {:?} reverted", self.chain, hash);
            return Err(AtomError::Reverted(format!("{:?}", hash)));
        }
        info!("{}: {:?} mined", self.chain, hash);
        Ok(hash)
    }

    fn parse_address(&self, address: &str) -> Result<Address, AtomError> {
        address.parse::<Address>().map_err(|e| AtomError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Atom for AccountAtom {
    fn priority_code(&self) -> u32 {
        self.priority_code
    }

    fn recipient_id(&self, address: &str) -> Result<Vec<u8>, AtomError> {
        Ok(self.parse_address(address)?.as_bytes().to_vec())
    }

    async fn initiate(
        &self,
        to: &str,
        secret_hash: SecretHash,
        value: U256,
        expiry: i64,
    ) -> Result<(), AtomError> {
        let recipient = self.parse_address(to)?;
        let expiry = u64::try_from(expiry)
            .map_err(|_| AtomError::ValueOutOfRange(expiry.to_string()))?;

        *self.details.write() = Some(AccountDetails {
            contract: self.contract,
            swap_id: self.swap_id,
        });

        let swap_id = self.swap_id;
        if !self.flag(SwapCall::Initiatable { swap_id }).await? {
            info!("{}: swap {} already initiated", self.chain, hex::encode(swap_id));
            return Ok(());
        }

        let balance = self.connector.balance().await?;
        if balance < value {
            return Err(AtomError::InsufficientFunds {
                have: balance,
                need: value,
            });
        }

        self.transact(
            SwapCall::Initiate {
                swap_id,
                recipient,
                secret_hash,
                expiry: U256::from(expiry),
            },
            value,
        )
        .await?;
        Ok(())
    }

    async fn audit(&self) -> Result<AuditReport, AtomError> {
        let details = self.loaded()?;
        let audit = ContractAudit::decode(
            &self
                .query(SwapCall::Audit {
                    swap_id: details.swap_id,
                })
                .await?,
        )?;

        if audit.recipient.is_zero() && audit.value.is_zero() {
            return Err(AtomError::ContractNotFound);
        }
        if audit.expiry > U256::from(i64::MAX as u64) {
            return Err(AtomError::MalformedContract(format!(
                "expiry {} out of range",
                audit.expiry
            )));
        }

        Ok(AuditReport {
            secret_hash: audit.secret_hash,
            recipient: audit.recipient.as_bytes().to_vec(),
            value: audit.value,
            expiry: audit.expiry.as_u64() as i64,
        })
    }

    async fn audit_secret(&self) -> Result<Secret, AtomError> {
        let details = self.loaded()?;
        let secret = decode_bytes32(
            &self
                .query(SwapCall::AuditSecret {
                    swap_id: details.swap_id,
                })
                .await?,
        )?;

        if secret == [0; 32] {
            return Err(AtomError::NotYetRevealed);
        }
        Ok(Secret::from_bytes(secret))
    }

    async fn redeem(&self, secret: &Secret) -> Result<(), AtomError> {
        let details = self.loaded()?;
        let swap_id = details.swap_id;

        if !self.flag(SwapCall::Redeemable { swap_id }).await? {
            return Err(AtomError::AlreadyRedeemedOrRefunded);
        }

        self.transact(
            SwapCall::Redeem {
                swap_id,
                secret: secret.clone(),
            },
            U256::zero(),
        )
        .await?;
        Ok(())
    }

    async fn refund(&self) -> Result<(), AtomError> {
        let details = self.loaded()?;
        let swap_id = details.swap_id;

        let report = self.audit().await?;
        if self.clock.now() < report.expiry {
            return Err(AtomError::NotExpired {
                expiry: report.expiry,
            });
        }
        if !self.flag(SwapCall::Refundable { swap_id }).await? {
            return Err(AtomError::AlreadyRedeemedOrRefunded);
        }

        self.transact(SwapCall::Refund { swap_id }, U256::zero()).await?;
        Ok(())
    }

    fn serialize(&self) -> Result<Vec<u8>, AtomError> {
        let details = self.details.read().clone().ok_or(AtomError::NotLoaded)?;
        serde_json::to_vec(&details).map_err(|e| AtomError::InvalidDetails(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<(), AtomError> {
        let details: AccountDetails =
            serde_json::from_slice(bytes).map_err(|e| AtomError::InvalidDetails(e.to_string()))?;
        *self.details.write() = Some(details);
        Ok(())
    }
}
