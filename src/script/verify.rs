//! Consensus check of contract spends
//!
//! Runs a signed spend through libbitcoinconsensus with the pre-taproot rule
//! set (P2SH, strict DER, low-S, NULLFAIL, CHECKLOCKTIMEVERIFY) so a spend the
//! network would reject never leaves the process.

use super::ScriptError;

use bitcoin::consensus::encode::serialize;
use bitcoin::{Transaction, TxOut};

/// Verify that input `input_index` of `tx` validly spends the P2SH output
/// `prevout`
pub fn verify_p2sh_spend(
    tx: &Transaction,
    input_index: usize,
    prevout: &TxOut,
) -> Result<(), ScriptError> {
    if input_index >= tx.input.len() {
        return Err(ScriptError::InputIndex(input_index));
    }
    if !prevout.script_pubkey.is_p2sh() {
        return Err(ScriptError::NotP2sh);
    }

    prevout
        .script_pubkey
        .verify(input_index, prevout.value, &serialize(tx))
        .map_err(|e| ScriptError::Consensus(e.to_string()))
}
