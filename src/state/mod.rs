//! Persistent swap state
//!
//! Handles:
//! - Protocol status per order, the basis for crash resume
//! - Initiate details (expiry, secret hash) and the secret
//! - Serialized atom details for both legs
//! - The redeemable marker used by recovery sweeps

mod memory;
mod postgres;

pub use memory::MemorySwapStore;
pub use postgres::PgSwapStore;

use crate::script::{Secret, SecretHash};
use crate::OrderId;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol progress of one order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    #[default]
    InfoSubmitted,
    InitiateDetailsAcquired,
    Initiated,
    SentSwapDetails,
    ReceivedSwapDetails,
    Audited,
    RedeemDetailsAcquired,
    Redeemed,
    Complained,
}

impl SwapStatus {
    pub const ALL: [SwapStatus; 9] = [
        SwapStatus::InfoSubmitted,
        SwapStatus::InitiateDetailsAcquired,
        SwapStatus::Initiated,
        SwapStatus::SentSwapDetails,
        SwapStatus::ReceivedSwapDetails,
        SwapStatus::Audited,
        SwapStatus::RedeemDetailsAcquired,
        SwapStatus::Redeemed,
        SwapStatus::Complained,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::InfoSubmitted => "info_submitted",
            SwapStatus::InitiateDetailsAcquired => "initiate_details_acquired",
            SwapStatus::Initiated => "initiated",
            SwapStatus::SentSwapDetails => "sent_swap_details",
            SwapStatus::ReceivedSwapDetails => "received_swap_details",
            SwapStatus::Audited => "audited",
            SwapStatus::RedeemDetailsAcquired => "redeem_details_acquired",
            SwapStatus::Redeemed => "redeemed",
            SwapStatus::Complained => "complained",
        }
    }

    /// No phase runs after a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapStatus::Redeemed | SwapStatus::Complained)
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SwapStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {:?}", s)))
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no {field} stored for order {order}")]
    Missing { order: String, field: &'static str },

    #[error("corrupt swap state: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }

    pub(crate) fn missing(order_id: &OrderId, field: &'static str) -> Self {
        StoreError::Missing {
            order: crate::order_tag(order_id),
            field,
        }
    }
}

/// Durable per-order swap state
///
/// Every operation is atomic for its order id; operations on different
/// orders never block each other.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapStore: Send + Sync {
    /// `InfoSubmitted` for unknown orders
    async fn status(&self, order_id: &OrderId) -> Result<SwapStatus, StoreError>;

    async fn put_status(&self, order_id: &OrderId, status: SwapStatus) -> Result<(), StoreError>;

    async fn put_initiate_details(
        &self,
        order_id: &OrderId,
        expiry: i64,
        secret_hash: SecretHash,
    ) -> Result<(), StoreError>;

    async fn initiate_details(&self, order_id: &OrderId) -> Result<(i64, SecretHash), StoreError>;

    async fn put_redeem_details(&self, order_id: &OrderId, secret: &Secret) -> Result<(), StoreError>;

    async fn redeem_details(&self, order_id: &OrderId) -> Result<Secret, StoreError>;

    /// Serialized details of this side's own contract
    async fn put_atom_details(&self, order_id: &OrderId, details: &[u8]) -> Result<(), StoreError>;

    async fn atom_details(&self, order_id: &OrderId) -> Result<Vec<u8>, StoreError>;

    /// Serialized details of the counterparty's contract, received over the network
    async fn put_foreign_details(
        &self,
        order_id: &OrderId,
        details: &[u8],
    ) -> Result<(), StoreError>;

    async fn foreign_details(&self, order_id: &OrderId) -> Result<Vec<u8>, StoreError>;

    /// Mark that the counterparty's contract may now be redeemed
    async fn put_redeemable(&self, order_id: &OrderId) -> Result<(), StoreError>;

    /// Clear the redeemable marker once redeemed
    async fn redeemed(&self, order_id: &OrderId) -> Result<(), StoreError>;

    /// Orders marked redeemable and not yet redeemed
    async fn redeemable_orders(&self) -> Result<Vec<OrderId>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
