//! Chain binders ("atoms")
//!
//! An atom is one chain-side leg of a swap: the binder for that chain plus the
//! contract it owns or audits. Every chain exposes the same capability set
//! so the swap state machine never needs to know which chain it is driving.

pub mod account;
pub mod registry;
pub mod utxo;

#[cfg(test)]
pub(crate) mod sim;

pub use account::{AccountAtom, AccountDetails};
pub use registry::{ChainBinding, ChainRegistry};
pub use utxo::{UtxoAtom, UtxoDetails};

use crate::chain::ConnectorError;
use crate::script::{ContractError, ScriptError, Secret, SecretHash};
use crate::OrderId;

use async_trait::async_trait;
use ethers::types::U256;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Parameters a counterparty committed to in its on-chain contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub secret_hash: SecretHash,
    /// Chain-native recipient identifier: pubkey hash or account address
    pub recipient: Vec<u8>,
    pub value: U256,
    /// Unix timestamp after which the contract can be refunded
    pub expiry: i64,
}

/// How the swap state machine reacts to an atom failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry the phase after the cool-down
    Transient,
    /// The desired on-chain state already holds
    Satisfied,
    /// The counterparty broke the protocol
    Violation,
    /// Configuration or state error; stop without complaining
    Fatal,
}

#[derive(Error, Debug)]
pub enum AtomError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("contract not found on chain yet")]
    ContractNotFound,

    #[error("transaction {0} not yet confirmed")]
    Unconfirmed(String),

    #[error("secret not yet revealed on chain")]
    NotYetRevealed,

    #[error("contract not refundable before {expiry}")]
    NotExpired { expiry: i64 },

    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: U256, need: U256 },

    #[error("contract already initiated")]
    AlreadyInitiated,

    #[error("contract already redeemed or refunded")]
    AlreadyRedeemedOrRefunded,

    #[error("malformed contract: {0}")]
    MalformedContract(String),

    #[error("transaction {0} reverted")]
    Reverted(String),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("value {0} out of range for this chain")]
    ValueOutOfRange(String),

    #[error("invalid atom details: {0}")]
    InvalidDetails(String),

    #[error("atom details not loaded")]
    NotLoaded,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("secret does not match the contract's secret hash")]
    SecretMismatch,

    #[error("unknown chain {0}")]
    UnknownChain(String),
}

impl AtomError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AtomError::Connector(e) if e.is_retryable() => ErrorClass::Transient,
            AtomError::ContractNotFound
            | AtomError::Unconfirmed(_)
            | AtomError::NotYetRevealed
            | AtomError::NotExpired { .. }
            | AtomError::InsufficientFunds { .. } => ErrorClass::Transient,
            AtomError::AlreadyInitiated | AtomError::AlreadyRedeemedOrRefunded => {
                ErrorClass::Satisfied
            }
            AtomError::MalformedContract(_) => ErrorClass::Violation,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Capability set every chain binder exposes
///
/// Methods take `&self`; binders keep their contract details behind interior
/// mutability so one instance can be shared by the phases of a swap.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Atom: Send + Sync {
    /// Per-chain tie-break code; the lower code moves first
    fn priority_code(&self) -> u32;

    /// Chain-native recipient identifier for an address string on this chain
    fn recipient_id(&self, address: &str) -> Result<Vec<u8>, AtomError>;

    /// Lock `value` for `to`; succeeds without sending when this swap's
    /// contract already exists
    async fn initiate(
        &self,
        to: &str,
        secret_hash: SecretHash,
        value: U256,
        expiry: i64,
    ) -> Result<(), AtomError>;

    /// Committed parameters of the loaded contract
    async fn audit(&self) -> Result<AuditReport, AtomError>;

    /// Secret revealed by a redemption of the loaded contract
    async fn audit_secret(&self) -> Result<Secret, AtomError>;

    async fn redeem(&self, secret: &Secret) -> Result<(), AtomError>;

    async fn refund(&self) -> Result<(), AtomError>;

    fn serialize(&self) -> Result<Vec<u8>, AtomError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<(), AtomError>;
}

/// Binder for one of the supported chain families
pub enum ChainAtom {
    Utxo(UtxoAtom),
    Account(AccountAtom),
}

macro_rules! dispatch {
    ($self:ident, $atom:ident => $call:expr) => {
        match $self {
            ChainAtom::Utxo($atom) => $call,
            ChainAtom::Account($atom) => $call,
        }
    };
}

#[async_trait]
impl Atom for ChainAtom {
    fn priority_code(&self) -> u32 {
        dispatch!(self, atom => atom.priority_code())
    }

    fn recipient_id(&self, address: &str) -> Result<Vec<u8>, AtomError> {
        dispatch!(self, atom => atom.recipient_id(address))
    }

    async fn initiate(
        &self,
        to: &str,
        secret_hash: SecretHash,
        value: U256,
        expiry: i64,
    ) -> Result<(), AtomError> {
        dispatch!(self, atom => atom.initiate(to, secret_hash, value, expiry).await)
    }

    async fn audit(&self) -> Result<AuditReport, AtomError> {
        dispatch!(self, atom => atom.audit().await)
    }

    async fn audit_secret(&self) -> Result<Secret, AtomError> {
        dispatch!(self, atom => atom.audit_secret().await)
    }

    async fn redeem(&self, secret: &Secret) -> Result<(), AtomError> {
        dispatch!(self, atom => atom.redeem(secret).await)
    }

    async fn refund(&self) -> Result<(), AtomError> {
        dispatch!(self, atom => atom.refund().await)
    }

    fn serialize(&self) -> Result<Vec<u8>, AtomError> {
        dispatch!(self, atom => atom.serialize())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<(), AtomError> {
        dispatch!(self, atom => atom.deserialize(bytes))
    }
}

/// Builds binders by chain tag
pub trait AtomFactory: Send + Sync {
    type Atom: Atom + 'static;

    /// `order_id` identifies the contract on chains that key swaps by id
    fn build_atom(&self, chain: &str, order_id: &OrderId) -> Result<Self::Atom, AtomError>;
}

/// Holdings of one chain's wallet, in the chain's base unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletBalance {
    pub address: String,
    pub balance: String,
}

/// A chain key's signature over a caller-supplied challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeSignature {
    pub address: String,
    /// Hex; DER over double-SHA256 on UTXO chains, EIP-191 on account chains
    pub signature: String,
}

/// The daemon's own wallets across every chain, keyed by chain tag
#[async_trait]
pub trait Wallets: Send + Sync {
    async fn balances(&self) -> Result<BTreeMap<String, WalletBalance>, AtomError>;

    /// Prove control of every chain key by signing `challenge`
    async fn sign_challenge(
        &self,
        challenge: &str,
    ) -> Result<BTreeMap<String, ChallengeSignature>, AtomError>;
}

/// Poll `check` until it yields a value or `attempts` run out
pub(crate) async fn poll<T, F, Fut>(
    interval: std::time::Duration,
    attempts: u32,
    mut check: F,
) -> Result<Option<T>, AtomError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>, AtomError>>,
{
    for attempt in 0..attempts {
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(None)
}
