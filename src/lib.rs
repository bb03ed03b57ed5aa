//! Atom Swapper - HTLC atomic swaps between a UTXO chain and an account chain
//!
//! The daemon receives matched orders, decides which side moves first, locks
//! funds in hash-time-locked contracts on both chains and drives each swap
//! through a persisted, resumable state machine.

pub mod api;
pub mod atom;
pub mod chain;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod error;
pub mod keystore;
pub mod metrics;
pub mod network;
pub mod script;
pub mod state;
pub mod swap;
pub mod watchdog;

/// 32-byte order identifier assigned by the matching engine
pub type OrderId = [u8; 32];

/// Short order tag used to prefix log lines
pub fn order_tag(order_id: &OrderId) -> String {
    hex::encode(&order_id[..8])
}
