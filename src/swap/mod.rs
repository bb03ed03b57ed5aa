//! Swap state machine
//!
//! Drives one order through the request (first mover) or respond (second
//! mover) protocol. Every phase is gated on the persisted status so a
//! restarted process resumes where it stopped without repeating on-chain
//! actions.

mod machine;
mod request;
mod retry;

pub use machine::Swap;
pub use request::{Request, Role};
pub use retry::{RetryPolicy, Timing, Transient};

use crate::atom::{AtomError, ErrorClass};
use crate::clock::Clock;
use crate::network::{NetworkError, SwapNetwork};
use crate::state::{StoreError, SwapStatus, SwapStore};
use crate::watchdog::{Complaint, Watchdog, WatchdogError};

use ethers::types::U256;
use std::sync::Arc;
use thiserror::Error;

/// Collaborators shared by every swap of a process
#[derive(Clone)]
pub struct SwapContext {
    pub store: Arc<dyn SwapStore>,
    pub network: Arc<dyn SwapNetwork>,
    pub watchdog: Arc<dyn Watchdog>,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryPolicy,
    pub timing: Timing,
}

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("complained to watchdog ({complaint}): {reason}")]
    Complained { complaint: Complaint, reason: String },

    #[error("order was already complained about")]
    AlreadyComplained,

    #[error("both legs have priority code {0}")]
    SamePriority(u32),

    #[error("request secret does not match its secret hash")]
    InconsistentSecret,

    #[error("{role} cannot move from {from} to {to}")]
    IllegalTransition {
        role: Role,
        from: SwapStatus,
        to: SwapStatus,
    },

    #[error("{role} has no phase after {status}")]
    UnexpectedStatus { role: Role, status: SwapStatus },

    #[error(transparent)]
    Atom(#[from] AtomError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("complaint not delivered: {0}")]
    Watchdog(#[from] WatchdogError),
}

impl SwapError {
    /// Whether re-running the swap may get further
    pub fn is_retryable(&self) -> bool {
        match self {
            SwapError::Atom(e) => e.class() == ErrorClass::Transient,
            SwapError::Store(e) => e.is_retryable(),
            SwapError::Network(e) => e.is_retryable(),
            SwapError::Watchdog(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Ways a counterparty contract can fail its audit
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditViolation {
    #[error("malformed contract: {0}")]
    Malformed(String),

    #[error("secret hash does not match")]
    SecretHashMismatch,

    #[error("contract pays {actual}, expected {expected}")]
    WrongRecipient { expected: String, actual: String },

    #[error("contract locks {actual}, expected at least {expected}")]
    InsufficientValue { expected: U256, actual: U256 },

    #[error("contract expiry {expiry} is not after {now}")]
    Expired { expiry: i64, now: i64 },

    #[error("contract expiry {expiry} leaves less than {margin}s to lock funds in")]
    NoTimeBudget { expiry: i64, margin: i64 },

    #[error("contract not funded by {deadline}: {reason}")]
    NotFunded { deadline: i64, reason: String },
}
