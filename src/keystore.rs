//! Per-chain signing keys

use crate::config::ChainConfig;

use bitcoin::{NetworkKind, PrivateKey};
use ethers::signers::LocalWallet;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("no key configured for chain {0}")]
    UnknownChain(String),

    #[error("key for chain {chain} missing: set {var}")]
    Missing { chain: String, var: String },

    #[error("invalid key for chain {chain}: {reason}")]
    Invalid { chain: String, reason: String },
}

/// Signing capability for one chain
#[derive(Clone)]
pub enum Key {
    Utxo(PrivateKey),
    Account(LocalWallet),
}

#[cfg_attr(test, mockall::automock)]
pub trait Keystore: Send + Sync {
    fn get_key(&self, chain: &str) -> Result<Key, KeystoreError>;
}

/// Reads keys from the environment variables named in the chain configs:
/// WIF for UTXO chains, hex secp256k1 keys for account chains
pub struct EnvKeystore {
    chains: HashMap<String, ChainConfig>,
}

impl EnvKeystore {
    pub fn new(chains: &HashMap<String, ChainConfig>) -> Self {
        Self {
            chains: chains.clone(),
        }
    }
}

impl Keystore for EnvKeystore {
    fn get_key(&self, chain: &str) -> Result<Key, KeystoreError> {
        let config = self
            .chains
            .get(chain)
            .ok_or_else(|| KeystoreError::UnknownChain(chain.to_string()))?;
        let var = config.private_key_env();
        let raw = std::env::var(var).map_err(|_| KeystoreError::Missing {
            chain: chain.to_string(),
            var: var.to_string(),
        })?;
        let invalid = |reason: String| KeystoreError::Invalid {
            chain: chain.to_string(),
            reason,
        };

        match config {
            ChainConfig::Utxo(utxo) => {
                let key = PrivateKey::from_wif(raw.trim()).map_err(|e| invalid(e.to_string()))?;
                if key.network != NetworkKind::from(utxo.network) {
                    return Err(invalid(format!("WIF is not for {}", utxo.network)));
                }
                Ok(Key::Utxo(key))
            }
            ChainConfig::Account(_) => raw
                .trim()
                .parse::<LocalWallet>()
                .map(Key::Account)
                .map_err(|e| invalid(e.to_string())),
        }
    }
}
