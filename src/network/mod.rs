//! Signalling channel between the two swap parties
//!
//! Carries the owner address each side wants to be paid at and the
//! serialized contract details each side publishes after initiating.
//! Writes are keyed by the sender's own order id, reads by the
//! counterparty's order id.

mod http;
mod memory;

pub use http::HttpNetwork;
pub use memory::MemoryNetwork;

use crate::OrderId;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signalling server returned {status} for {path}")]
    Status { status: u16, path: String },

    #[error("undecodable signalling payload: {0}")]
    Decode(String),

    #[error("deadline passed waiting for {what} of order {order}")]
    DeadlineExceeded { order: String, what: &'static str },
}

impl NetworkError {
    /// `DeadlineExceeded` is final; everything else may succeed on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Http(_) => true,
            NetworkError::Status { status, .. } => *status >= 500 || *status == 429,
            NetworkError::Decode(_) | NetworkError::DeadlineExceeded { .. } => false,
        }
    }

    pub(crate) fn deadline(order_id: &OrderId, what: &'static str) -> Self {
        NetworkError::DeadlineExceeded {
            order: crate::order_tag(order_id),
            what,
        }
    }
}

/// Publish and await per-order values; every send may be repeated safely
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapNetwork: Send + Sync {
    async fn send_owner_address(&self, order_id: OrderId, address: String) -> Result<(), NetworkError>;

    /// Block until the address for `order_id` is published or `deadline`
    /// (Unix seconds) passes
    async fn receive_owner_address(&self, order_id: OrderId, deadline: i64) -> Result<String, NetworkError>;

    async fn send_swap_details(&self, order_id: OrderId, details: Vec<u8>) -> Result<(), NetworkError>;

    async fn receive_swap_details(&self, order_id: OrderId, deadline: i64) -> Result<Vec<u8>, NetworkError>;
}
