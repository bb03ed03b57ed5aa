//! Matched order to be swapped

use super::SwapError;
use crate::script::{Secret, SecretHash};
use crate::state::SwapStatus;
use crate::OrderId;

use ethers::types::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One side of a matched order pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(with = "hex::serde")]
    pub id: OrderId,
    /// The counterparty's order id
    #[serde(with = "hex::serde")]
    pub foreign_id: OrderId,
    pub send_currency: String,
    pub receive_currency: String,
    #[serde(with = "amount")]
    pub send_value: U256,
    #[serde(with = "amount")]
    pub receive_value: U256,
    /// Address on the receive chain this side wants to be paid at
    pub receive_address: String,
    /// Secret to use when this side moves first; random when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<Secret>,
    /// Must match `secret` when both are given
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hash")]
    pub secret_hash: Option<SecretHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_lock: Option<i64>,
}

/// First mover or second mover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Requestor,
    Responder,
}

const REQUESTOR_PATH: [SwapStatus; 7] = [
    SwapStatus::InfoSubmitted,
    SwapStatus::InitiateDetailsAcquired,
    SwapStatus::Initiated,
    SwapStatus::SentSwapDetails,
    SwapStatus::ReceivedSwapDetails,
    SwapStatus::Audited,
    SwapStatus::Redeemed,
];

const RESPONDER_PATH: [SwapStatus; 7] = [
    SwapStatus::InfoSubmitted,
    SwapStatus::ReceivedSwapDetails,
    SwapStatus::Audited,
    SwapStatus::Initiated,
    SwapStatus::SentSwapDetails,
    SwapStatus::RedeemDetailsAcquired,
    SwapStatus::Redeemed,
];

impl Role {
    /// The lower priority code moves first
    pub fn decide(personal_priority: u32, foreign_priority: u32) -> Result<Self, SwapError> {
        match personal_priority.cmp(&foreign_priority) {
            std::cmp::Ordering::Less => Ok(Role::Requestor),
            std::cmp::Ordering::Greater => Ok(Role::Responder),
            std::cmp::Ordering::Equal => Err(SwapError::SamePriority(personal_priority)),
        }
    }

    pub fn path(&self) -> &'static [SwapStatus] {
        match self {
            Role::Requestor => &REQUESTOR_PATH,
            Role::Responder => &RESPONDER_PATH,
        }
    }

    /// Forward along this role's path, or to `Complained` from any
    /// non-terminal status
    pub fn permits(&self, from: SwapStatus, to: SwapStatus) -> bool {
        if from.is_terminal() {
            return false;
        }
        if to == SwapStatus::Complained {
            return true;
        }
        let path = self.path();
        match (
            path.iter().position(|s| *s == from),
            path.iter().position(|s| *s == to),
        ) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Requestor => f.write_str("requestor"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Amounts as decimal strings; `0x` hex strings and JSON integers are accepted
mod amount {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(U256::from(n)),
            Raw::Text(s) => match s.strip_prefix("0x") {
                Some(hex) => U256::from_str_radix(hex, 16).map_err(serde::de::Error::custom),
                None => U256::from_dec_str(&s).map_err(serde::de::Error::custom),
            },
        }
    }
}

mod opt_hash {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<SecretHash>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(hash) => serializer.serialize_some(&hex::encode(hash)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<SecretHash>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| {
                let mut hash = [0u8; 32];
                hex::decode_to_slice(s.trim_start_matches("0x"), &mut hash)
                    .map_err(serde::de::Error::custom)?;
                Ok(hash)
            })
            .transpose()
    }
}
