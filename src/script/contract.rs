//! Call data codec for the account-chain swap contract
//!
//! The contract keeps one swap per 32-byte swap id and exposes:
//!
//! - `initiate(bytes32 swapID, address recipient, bytes32 secretHash, uint256 expiry)` payable
//! - `redeem(bytes32 swapID, bytes32 secret)`
//! - `refund(bytes32 swapID)`
//! - `audit(bytes32 swapID) returns (uint256 expiry, uint256 value, address recipient, address initiator, bytes32 secretHash)`
//! - `auditSecret(bytes32 swapID) returns (bytes32 secret)`
//! - `initiatable / redeemable / refundable(bytes32 swapID) returns (bool)`

use super::{Secret, SecretHash};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;
use thiserror::Error;

const INITIATE: &str = "initiate(bytes32,address,bytes32,uint256)";
const REDEEM: &str = "redeem(bytes32,bytes32)";
const REFUND: &str = "refund(bytes32)";
const AUDIT: &str = "audit(bytes32)";
const AUDIT_SECRET: &str = "auditSecret(bytes32)";
const INITIATABLE: &str = "initiatable(bytes32)";
const REDEEMABLE: &str = "redeemable(bytes32)";
const REFUNDABLE: &str = "refundable(bytes32)";

#[derive(Error, Debug)]
pub enum ContractError {
    #[error("call data shorter than a function selector")]
    Truncated,

    #[error("unknown function selector 0x{0}")]
    UnknownSelector(String),

    #[error("ABI decoding failed: {0}")]
    Abi(#[from] abi::Error),

    #[error("unexpected return data layout")]
    Layout,
}

/// A call into the swap contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapCall {
    Initiate {
        swap_id: [u8; 32],
        recipient: Address,
        secret_hash: SecretHash,
        expiry: U256,
    },
    Redeem {
        swap_id: [u8; 32],
        secret: Secret,
    },
    Refund {
        swap_id: [u8; 32],
    },
    Audit {
        swap_id: [u8; 32],
    },
    AuditSecret {
        swap_id: [u8; 32],
    },
    Initiatable {
        swap_id: [u8; 32],
    },
    Redeemable {
        swap_id: [u8; 32],
    },
    Refundable {
        swap_id: [u8; 32],
    },
}

impl SwapCall {
    fn signature(&self) -> &'static str {
        match self {
            SwapCall::Initiate { .. } => INITIATE,
            SwapCall::Redeem { .. } => REDEEM,
            SwapCall::Refund { .. } => REFUND,
            SwapCall::Audit { .. } => AUDIT,
            SwapCall::AuditSecret { .. } => AUDIT_SECRET,
            SwapCall::Initiatable { .. } => INITIATABLE,
            SwapCall::Redeemable { .. } => REDEEMABLE,
            SwapCall::Refundable { .. } => REFUNDABLE,
        }
    }

    /// ABI-encoded call data: selector followed by the arguments
    pub fn encode(&self) -> Bytes {
        let args = match self {
            SwapCall::Initiate {
                swap_id,
                recipient,
                secret_hash,
                expiry,
            } => vec![
                Token::FixedBytes(swap_id.to_vec()),
                Token::Address(*recipient),
                Token::FixedBytes(secret_hash.to_vec()),
                Token::Uint(*expiry),
            ],
            SwapCall::Redeem { swap_id, secret } => vec![
                Token::FixedBytes(swap_id.to_vec()),
                Token::FixedBytes(secret.as_bytes().to_vec()),
            ],
            SwapCall::Refund { swap_id }
            | SwapCall::Audit { swap_id }
            | SwapCall::AuditSecret { swap_id }
            | SwapCall::Initiatable { swap_id }
            | SwapCall::Redeemable { swap_id }
            | SwapCall::Refundable { swap_id } => vec![Token::FixedBytes(swap_id.to_vec())],
        };

        let mut data = id(self.signature()).to_vec();
        data.extend(abi::encode(&args));
        data.into()
    }

    /// Interpret call data produced by [`SwapCall::encode`]
    pub fn decode(data: &[u8]) -> Result<Self, ContractError> {
        if data.len() < 4 {
            return Err(ContractError::Truncated);
        }
        let (selector, args) = data.split_at(4);

        let bytes32 = ParamType::FixedBytes(32);
        if selector == id(INITIATE) {
            let tokens = abi::decode(
                &[bytes32.clone(), ParamType::Address, bytes32, ParamType::Uint(256)],
                args,
            )?;
            match tokens.as_slice() {
                [swap_id, Token::Address(recipient), secret_hash, Token::Uint(expiry)] => {
                    Ok(SwapCall::Initiate {
                        swap_id: fixed32(swap_id)?,
                        recipient: *recipient,
                        secret_hash: fixed32(secret_hash)?,
                        expiry: *expiry,
                    })
                }
                _ => Err(ContractError::Layout),
            }
        } else if selector == id(REDEEM) {
            let tokens = abi::decode(&[bytes32.clone(), bytes32], args)?;
            match tokens.as_slice() {
                [swap_id, secret] => Ok(SwapCall::Redeem {
                    swap_id: fixed32(swap_id)?,
                    secret: Secret::from_bytes(fixed32(secret)?),
                }),
                _ => Err(ContractError::Layout),
            }
        } else {
            let tokens = abi::decode(&[bytes32], args)?;
            let swap_id = match tokens.as_slice() {
                [swap_id] => fixed32(swap_id)?,
                _ => return Err(ContractError::Layout),
            };
            let call = match selector {
                s if s == id(REFUND) => SwapCall::Refund { swap_id },
                s if s == id(AUDIT) => SwapCall::Audit { swap_id },
                s if s == id(AUDIT_SECRET) => SwapCall::AuditSecret { swap_id },
                s if s == id(INITIATABLE) => SwapCall::Initiatable { swap_id },
                s if s == id(REDEEMABLE) => SwapCall::Redeemable { swap_id },
                s if s == id(REFUNDABLE) => SwapCall::Refundable { swap_id },
                s => return Err(ContractError::UnknownSelector(hex::encode(s))),
            };
            Ok(call)
        }
    }
}

fn fixed32(token: &Token) -> Result<[u8; 32], ContractError> {
    match token {
        Token::FixedBytes(bytes) => bytes.as_slice().try_into().map_err(|_| ContractError::Layout),
        _ => Err(ContractError::Layout),
    }
}

/// Return value of `audit(bytes32)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractAudit {
    pub expiry: U256,
    pub value: U256,
    pub recipient: Address,
    pub initiator: Address,
    pub secret_hash: SecretHash,
}

impl ContractAudit {
    pub fn encode(&self) -> Bytes {
        abi::encode(&[
            Token::Uint(self.expiry),
            Token::Uint(self.value),
            Token::Address(self.recipient),
            Token::Address(self.initiator),
            Token::FixedBytes(self.secret_hash.to_vec()),
        ])
        .into()
    }

    pub fn decode(output: &[u8]) -> Result<Self, ContractError> {
        let tokens = abi::decode(
            &[
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Address,
                ParamType::Address,
                ParamType::FixedBytes(32),
            ],
            output,
        )?;
        match tokens.as_slice() {
            [Token::Uint(expiry), Token::Uint(value), Token::Address(recipient), Token::Address(initiator), secret_hash] => {
                Ok(Self {
                    expiry: *expiry,
                    value: *value,
                    recipient: *recipient,
                    initiator: *initiator,
                    secret_hash: fixed32(secret_hash)?,
                })
            }
            _ => Err(ContractError::Layout),
        }
    }
}

pub fn encode_bool(value: bool) -> Bytes {
    abi::encode(&[Token::Bool(value)]).into()
}

pub fn decode_bool(output: &[u8]) -> Result<bool, ContractError> {
    match abi::decode(&[ParamType::Bool], output)?.as_slice() {
        [Token::Bool(value)] => Ok(*value),
        _ => Err(ContractError::Layout),
    }
}

pub fn encode_bytes32(value: &[u8; 32]) -> Bytes {
    abi::encode(&[Token::FixedBytes(value.to_vec())]).into()
}

pub fn decode_bytes32(output: &[u8]) -> Result<[u8; 32], ContractError> {
    match abi::decode(&[ParamType::FixedBytes(32)], output)?.as_slice() {
        [token] => fixed32(token),
        _ => Err(ContractError::Layout),
    }
}
