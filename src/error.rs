//! Error types for the swap daemon

use crate::atom::AtomError;
use crate::chain::ConnectorError;
use crate::keystore::KeystoreError;
use crate::state::StoreError;
use crate::swap::SwapError;
use thiserror::Error;

/// Main error type for the daemon
#[derive(Error, Debug)]
pub enum SwapperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Atom(#[from] AtomError),

    #[error(transparent)]
    Swap(#[from] SwapError),

    #[error("Order {0} is already being processed")]
    InFlight(String),

    #[error("Engine is not accepting requests")]
    EngineStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapperError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SwapperError::Connector(e) => e.is_retryable(),
            SwapperError::Store(e) => e.is_retryable(),
            SwapperError::Swap(e) => e.is_retryable(),
            SwapperError::InFlight(_) => true,
            _ => false,
        }
    }
}

/// Result type for daemon operations
pub type SwapperResult<T> = Result<T, SwapperError>;
