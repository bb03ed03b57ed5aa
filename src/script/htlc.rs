//! HTLC locking script and unlocking scripts for P2SH outputs
//!
//! Locking script layout (the ELSE branch is the refund path):
//!
//! ```text
//! OP_IF
//!     OP_SIZE 32 OP_EQUALVERIFY OP_SHA256 <secret_hash> OP_EQUALVERIFY
//!     OP_DUP OP_HASH160 <redeemer_pkh>
//! OP_ELSE
//!     <lock_time> OP_CHECKLOCKTIMEVERIFY OP_DROP
//!     OP_DUP OP_HASH160 <refunder_pkh>
//! OP_ENDIF
//! OP_EQUALVERIFY OP_CHECKSIG
//! ```

use super::{read_script_num, sha256, ScriptError, Secret, SecretHash};

use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_HASH160, OP_IF,
    OP_PUSHNUM_1, OP_PUSHNUM_16, OP_PUSHNUM_NEG1, OP_SHA256, OP_SIZE,
};
use bitcoin::opcodes::Opcode;
use bitcoin::script::{Builder, Instruction, PushBytes, Script, ScriptBuf};
use bitcoin::PublicKey;

/// Required secret length, checked on-chain with OP_SIZE
pub const SECRET_SIZE: i64 = 32;

/// Parameters committed to by an HTLC locking script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcFields {
    pub redeemer: [u8; 20],
    pub refunder: [u8; 20],
    pub lock_time: i64,
    pub secret_hash: SecretHash,
}

/// Build the HTLC locking script
pub fn build_htlc_script(
    redeemer: &[u8; 20],
    refunder: &[u8; 20],
    lock_time: i64,
    secret_hash: &SecretHash,
) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_SIZE)
        .push_int(SECRET_SIZE)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_SHA256)
        .push_slice(secret_hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(redeemer)
        .push_opcode(OP_ELSE)
        .push_int(lock_time)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(refunder)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// Unlocking script taking the secret branch: `sig pubkey secret 1 contract`
pub fn build_redeem_sig_script(
    contract: &Script,
    sig: &[u8],
    pubkey: &[u8],
    secret: &Secret,
) -> Result<ScriptBuf, ScriptError> {
    Ok(Builder::new()
        .push_slice(push_bytes(sig)?)
        .push_slice(push_bytes(pubkey)?)
        .push_slice(secret.as_bytes())
        .push_int(1)
        .push_slice(push_bytes(contract.as_bytes())?)
        .into_script())
}

/// Unlocking script taking the refund branch: `sig pubkey 0 contract`
pub fn build_refund_sig_script(
    contract: &Script,
    sig: &[u8],
    pubkey: &[u8],
) -> Result<ScriptBuf, ScriptError> {
    Ok(Builder::new()
        .push_slice(push_bytes(sig)?)
        .push_slice(push_bytes(pubkey)?)
        .push_int(0)
        .push_slice(push_bytes(contract.as_bytes())?)
        .into_script())
}

/// Standard pay-to-pubkey-hash unlocking script: `sig pubkey`
pub fn build_p2pkh_sig_script(sig: &[u8], pubkey: &PublicKey) -> Result<ScriptBuf, ScriptError> {
    Ok(Builder::new()
        .push_slice(push_bytes(sig)?)
        .push_key(pubkey)
        .into_script())
}

fn push_bytes(data: &[u8]) -> Result<&PushBytes, ScriptError> {
    <&PushBytes>::try_from(data).map_err(|_| ScriptError::PushTooLarge(data.len()))
}

/// One position of the recognized template
#[derive(Clone, Copy)]
enum Slot {
    Op(Opcode),
    Int(i64),
    SecretHash,
    Redeemer,
    Refunder,
    LockTime,
}

const TEMPLATE: [Slot; 20] = [
    Slot::Op(OP_IF),
    Slot::Op(OP_SIZE),
    Slot::Int(SECRET_SIZE),
    Slot::Op(OP_EQUALVERIFY),
    Slot::Op(OP_SHA256),
    Slot::SecretHash,
    Slot::Op(OP_EQUALVERIFY),
    Slot::Op(OP_DUP),
    Slot::Op(OP_HASH160),
    Slot::Redeemer,
    Slot::Op(OP_ELSE),
    Slot::LockTime,
    Slot::Op(OP_CLTV),
    Slot::Op(OP_DROP),
    Slot::Op(OP_DUP),
    Slot::Op(OP_HASH160),
    Slot::Refunder,
    Slot::Op(OP_ENDIF),
    Slot::Op(OP_EQUALVERIFY),
    Slot::Op(OP_CHECKSIG),
];

/// Recover the committed parameters of an HTLC locking script
pub fn extract_htlc_fields(script: &Script) -> Result<HtlcFields, ScriptError> {
    let instructions = script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ScriptError::NotAnHtlc)?;
    if instructions.len() != TEMPLATE.len() {
        return Err(ScriptError::NotAnHtlc);
    }

    let mut redeemer: Option<[u8; 20]> = None;
    let mut refunder: Option<[u8; 20]> = None;
    let mut lock_time: Option<i64> = None;
    let mut secret_hash: Option<SecretHash> = None;

    for (slot, instruction) in TEMPLATE.iter().zip(&instructions) {
        match (*slot, instruction) {
            (Slot::Op(expected), Instruction::Op(op)) if *op == expected => {}
            (Slot::Int(expected), instruction) if instruction_num(instruction) == Some(expected) => {}
            (Slot::SecretHash, Instruction::PushBytes(data)) => {
                secret_hash = Some(data.as_bytes().try_into().map_err(|_| ScriptError::NotAnHtlc)?);
            }
            (Slot::Redeemer, Instruction::PushBytes(data)) => {
                redeemer = Some(data.as_bytes().try_into().map_err(|_| ScriptError::NotAnHtlc)?);
            }
            (Slot::Refunder, Instruction::PushBytes(data)) => {
                refunder = Some(data.as_bytes().try_into().map_err(|_| ScriptError::NotAnHtlc)?);
            }
            (Slot::LockTime, instruction) => {
                lock_time = Some(instruction_num(instruction).ok_or(ScriptError::NotAnHtlc)?);
            }
            _ => return Err(ScriptError::NotAnHtlc),
        }
    }

    match (redeemer, refunder, lock_time, secret_hash) {
        (Some(redeemer), Some(refunder), Some(lock_time), Some(secret_hash)) => Ok(HtlcFields {
            redeemer,
            refunder,
            lock_time,
            secret_hash,
        }),
        _ => Err(ScriptError::NotAnHtlc),
    }
}

/// Numeric value of a push, whether a small-int opcode or pushed bytes
fn instruction_num(instruction: &Instruction) -> Option<i64> {
    match instruction {
        Instruction::PushBytes(data) => read_script_num(data.as_bytes(), 5),
        Instruction::Op(op) if *op == OP_PUSHNUM_NEG1 => Some(-1),
        Instruction::Op(op) => {
            let code = op.to_u8();
            (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8())
                .contains(&code)
                .then(|| i64::from(code - OP_PUSHNUM_1.to_u8() + 1))
        }
    }
}

/// Find the secret among the pushes of a spending input's unlocking script
pub fn extract_secret(
    unlocking_script: &Script,
    secret_hash: &SecretHash,
) -> Result<Secret, ScriptError> {
    for instruction in unlocking_script.instructions() {
        let Ok(Instruction::PushBytes(data)) = instruction else {
            continue;
        };
        if sha256(data.as_bytes()) == *secret_hash {
            if let Some(secret) = Secret::from_slice(data.as_bytes()) {
                return Ok(secret);
            }
        }
    }
    Err(ScriptError::SecretNotFound)
}
