//! Script and contract construction
//!
//! Pure, deterministic builders and parsers:
//! - HTLC locking script and its redeem/refund unlocking scripts (UTXO chains)
//! - A consensus check of contract spends before broadcast
//! - Call data codec for the on-chain swap contract (account chains)

pub mod contract;
pub mod htlc;
mod secret;
pub mod verify;

pub use contract::{ContractAudit, ContractError, SwapCall};
pub use htlc::{
    build_htlc_script, build_p2pkh_sig_script, build_redeem_sig_script, build_refund_sig_script,
    extract_htlc_fields, extract_secret, HtlcFields,
};
pub use secret::{sha256, Secret, SecretHash};
pub use verify::verify_p2sh_spend;

use thiserror::Error;

/// Errors from script construction, parsing and evaluation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script does not match the HTLC template")]
    NotAnHtlc,

    #[error("no pushed data hashes to the expected secret hash")]
    SecretNotFound,

    #[error("push of {0} bytes exceeds the script element limit")]
    PushTooLarge(usize),

    #[error("spent output is not pay-to-script-hash")]
    NotP2sh,

    #[error("spend rejected by consensus rules: {0}")]
    Consensus(String),

    #[error("input index {0} out of range")]
    InputIndex(usize),
}

/// Decode a minimally encoded script number of at most `max_len` bytes
pub(crate) fn read_script_num(bytes: &[u8], max_len: usize) -> Option<i64> {
    if bytes.len() > max_len {
        return None;
    }
    let Some(&last) = bytes.last() else {
        return Some(0);
    };

    let mut value: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        value |= i64::from(*byte) << (8 * i);
    }

    if last & 0x80 != 0 {
        value &= !(0x80_i64 << (8 * (bytes.len() - 1)));
        value = -value;
    }
    Some(value)
}
