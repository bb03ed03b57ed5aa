//! Chain registry: builds binders by chain tag

use super::{
    AccountAtom, AtomError, AtomFactory, ChainAtom, ChallengeSignature, UtxoAtom, WalletBalance,
    Wallets,
};
use crate::chain::{AccountConnector, EsploraClient, EthereumProvider, UtxoConnector};
use crate::clock::Clock;
use crate::config::{AccountChainConfig, ChainConfig, Settings, UtxoChainConfig};
use crate::error::{SwapperError, SwapperResult};
use crate::keystore::{Key, Keystore};
use crate::OrderId;

use async_trait::async_trait;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::{Network, PrivateKey};
use ethers::types::Address;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Shared per-chain resources binders are built from
pub enum ChainBinding {
    Utxo {
        config: UtxoChainConfig,
        connector: Arc<dyn UtxoConnector>,
        key: PrivateKey,
    },
    Account {
        config: AccountChainConfig,
        contract: Address,
        connector: Arc<dyn AccountConnector>,
    },
}

impl ChainBinding {
    pub fn priority_code(&self) -> u32 {
        match self {
            ChainBinding::Utxo { config, .. } => config.priority_code,
            ChainBinding::Account { config, .. } => config.priority_code,
        }
    }
}

pub struct ChainRegistry {
    chains: HashMap<String, ChainBinding>,
    clock: Arc<dyn Clock>,
}

impl ChainRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            chains: HashMap::new(),
            clock,
        }
    }

    pub fn with_chain(mut self, tag: &str, binding: ChainBinding) -> Self {
        self.chains.insert(tag.to_string(), binding);
        self
    }

    /// Connect every configured chain with the keystore's keys
    pub fn from_settings(
        settings: &Settings,
        keystore: &dyn Keystore,
        clock: Arc<dyn Clock>,
    ) -> SwapperResult<Self> {
        let mut registry = Self::new(clock);

        for (tag, chain) in &settings.chains {
            let binding = match (chain, keystore.get_key(tag)?) {
                (ChainConfig::Utxo(config), Key::Utxo(key)) => ChainBinding::Utxo {
                    config: config.clone(),
                    connector: Arc::new(EsploraClient::new(tag, &config.api_url)?),
                    key,
                },
                (ChainConfig::Account(config), Key::Account(wallet)) => {
                    let contract = config.contract_address.parse::<Address>().map_err(|e| {
                        SwapperError::Config(format!("{} contract address: {}", tag, e))
                    })?;
                    ChainBinding::Account {
                        config: config.clone(),
                        contract,
                        connector: Arc::new(EthereumProvider::new(tag, config, wallet)?),
                    }
                }
                _ => {
                    return Err(SwapperError::Config(format!(
                        "key kind does not match chain {}",
                        tag
                    )))
                }
            };
            info!("Registered chain {} (priority {})", tag, binding.priority_code());
            registry.chains.insert(tag.clone(), binding);
        }

        Ok(registry)
    }

    pub fn priority_code(&self, chain: &str) -> Option<u32> {
        self.chains.get(chain).map(ChainBinding::priority_code)
    }

    pub fn chains(&self) -> impl Iterator<Item = &String> {
        self.chains.keys()
    }
}

impl AtomFactory for ChainRegistry {
    type Atom = ChainAtom;

    fn build_atom(&self, chain: &str, order_id: &OrderId) -> Result<ChainAtom, AtomError> {
        let binding = self
            .chains
            .get(chain)
            .ok_or_else(|| AtomError::UnknownChain(chain.to_string()))?;

        Ok(match binding {
            ChainBinding::Utxo {
                config,
                connector,
                key,
            } => ChainAtom::Utxo(UtxoAtom::new(
                chain,
                config,
                connector.clone(),
                *key,
                self.clock.clone(),
            )),
            ChainBinding::Account {
                config,
                contract,
                connector,
            } => ChainAtom::Account(AccountAtom::new(
                chain,
                config,
                *contract,
                *order_id,
                connector.clone(),
                self.clock.clone(),
            )),
        })
    }
}

fn wallet_address(key: &PrivateKey, network: Network) -> bitcoin::Address {
    bitcoin::Address::p2pkh(key.public_key(&Secp256k1::new()), network)
}

#[async_trait]
impl Wallets for ChainRegistry {
    async fn balances(&self) -> Result<BTreeMap<String, WalletBalance>, AtomError> {
        let mut balances = BTreeMap::new();
        for (tag, binding) in &self.chains {
            let balance = match binding {
                ChainBinding::Utxo {
                    config,
                    connector,
                    key,
                } => {
                    let address = wallet_address(key, config.network);
                    let sats: u64 = connector
                        .unspent_outputs(&address)
                        .await?
                        .iter()
                        .map(|utxo| utxo.value.to_sat())
                        .sum();
                    WalletBalance {
                        address: address.to_string(),
                        balance: sats.to_string(),
                    }
                }
                ChainBinding::Account { connector, .. } => WalletBalance {
                    address: format!("{:?}", connector.address()),
                    balance: connector.balance().await?.to_string(),
                },
            };
            balances.insert(tag.clone(), balance);
        }
        Ok(balances)
    }

    async fn sign_challenge(
        &self,
        challenge: &str,
    ) -> Result<BTreeMap<String, ChallengeSignature>, AtomError> {
        let mut signatures = BTreeMap::new();
        for (tag, binding) in &self.chains {
            let signature = match binding {
                ChainBinding::Utxo { config, key, .. } => {
                    let digest = sha256d::Hash::hash(challenge.as_bytes());
                    let message = Message::from_digest(digest.to_byte_array());
                    let signature = Secp256k1::signing_only().sign_ecdsa(&message, &key.inner);
                    ChallengeSignature {
                        address: wallet_address(key, config.network).to_string(),
                        signature: hex::encode(signature.serialize_der()),
                    }
                }
                ChainBinding::Account { connector, .. } => ChallengeSignature {
                    address: format!("{:?}", connector.address()),
                    signature: hex::encode(connector.sign_message(challenge.as_bytes()).await?),
                },
            };
            signatures.insert(tag.clone(), signature);
        }
        Ok(signatures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::sim::{SimAccountChain, SimUtxoChain};
    use crate::atom::Atom;
    use crate::clock::ManualClock;
    use crate::chain::ConnectorError;
    use crate::keystore::MockKeystore;
    use bitcoin::secp256k1::SecretKey;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::U256;

    fn wallet() -> LocalWallet {
        LocalWallet::from_bytes(&[0x11; 32]).unwrap()
    }

    fn btc_key() -> PrivateKey {
        PrivateKey::new(SecretKey::from_slice(&[1; 32]).unwrap(), Network::Regtest)
    }

    fn registry() -> ChainRegistry {
        registry_with(SimUtxoChain::new(Arc::new(ManualClock::new(0))), None)
    }

    fn registry_with(
        utxo_chain: Arc<SimUtxoChain>,
        account: Option<(Arc<SimAccountChain>, LocalWallet)>,
    ) -> ChainRegistry {
        let clock = Arc::new(ManualClock::new(0));
        let utxo = UtxoChainConfig {
            priority_code: 0,
            network: Network::Regtest,
            api_url: String::new(),
            fee_sats: 10_000,
            min_confirmations: 1,
            poll_interval_ms: 1,
            private_key_env: String::new(),
        };
        let account_config = AccountChainConfig {
            priority_code: 1,
            chain_id: 1337,
            rpc_urls: vec![],
            contract_address: String::new(),
            gas_limit: 3_000_000,
            gas_price_gwei: None,
            instant_receipts: true,
            poll_interval_ms: 1,
            private_key_env: String::new(),
        };
        let contract = Address::repeat_byte(0xcc);
        let connector = match account {
            Some((chain, wallet)) => chain.wallet_connector(wallet),
            None => SimAccountChain::new(contract, clock.clone()).connector(Address::repeat_byte(0xa1)),
        };

        ChainRegistry::new(clock)
            .with_chain(
                "BTC",
                ChainBinding::Utxo {
                    config: utxo,
                    connector: utxo_chain,
                    key: btc_key(),
                },
            )
            .with_chain(
                "ETH",
                ChainBinding::Account {
                    config: account_config,
                    contract,
                    connector,
                },
            )
    }

    #[tokio::test]
    async fn test_wallet_balances() {
        let clock = Arc::new(ManualClock::new(0));
        let utxo_chain = SimUtxoChain::new(clock.clone());
        let address = wallet_address(&btc_key(), Network::Regtest);
        utxo_chain.fund(&address, 40_000);
        utxo_chain.fund(&address, 2_000);
        let account_chain = SimAccountChain::new(Address::repeat_byte(0xcc), clock);
        account_chain.fund(wallet().address(), U256::from(7u64));

        let registry = registry_with(utxo_chain, Some((account_chain, wallet())));
        let balances = registry.balances().await.unwrap();

        assert_eq!(balances["BTC"].address, address.to_string());
        assert_eq!(balances["BTC"].balance, "42000");
        assert_eq!(balances["ETH"].address, format!("{:?}", wallet().address()));
        assert_eq!(balances["ETH"].balance, "7");
    }

    #[tokio::test]
    async fn test_sign_challenge_with_every_key() {
        let clock = Arc::new(ManualClock::new(0));
        let account_chain = SimAccountChain::new(Address::repeat_byte(0xcc), clock.clone());
        let registry = registry_with(SimUtxoChain::new(clock), Some((account_chain, wallet())));

        let signatures = registry.sign_challenge("prove-it").await.unwrap();

        let secp = Secp256k1::new();
        let der = hex::decode(&signatures["BTC"].signature).unwrap();
        let signature = bitcoin::secp256k1::ecdsa::Signature::from_der(&der).unwrap();
        let digest = sha256d::Hash::hash(b"prove-it");
        secp.verify_ecdsa(
            &Message::from_digest(digest.to_byte_array()),
            &signature,
            &btc_key().public_key(&secp).inner,
        )
        .unwrap();

        let raw = hex::decode(&signatures["ETH"].signature).unwrap();
        let signature = ethers::types::Signature::try_from(raw.as_slice()).unwrap();
        signature.verify("prove-it", wallet().address()).unwrap();
    }

    #[tokio::test]
    async fn test_sign_challenge_needs_account_key() {
        let registry = registry();
        assert!(matches!(
            registry.sign_challenge("prove-it").await,
            Err(AtomError::Connector(ConnectorError::Signing(_)))
        ));
    }

    #[test]
    fn test_build_atoms_by_tag() {
        let registry = registry();

        let btc = registry.build_atom("BTC", &[0; 32]).unwrap();
        let eth = registry.build_atom("ETH", &[0; 32]).unwrap();
        assert!(matches!(btc, ChainAtom::Utxo(_)));
        assert!(matches!(eth, ChainAtom::Account(_)));
        assert_eq!(btc.priority_code(), 0);
        assert_eq!(eth.priority_code(), 1);
        assert_eq!(registry.priority_code("ETH"), Some(1));

        assert!(matches!(
            registry.build_atom("DOGE", &[0; 32]),
            Err(AtomError::UnknownChain(_))
        ));
    }

    #[test]
    fn test_from_settings_rejects_mismatched_key() {
        let settings = Settings::from_toml_str(
            r#"
[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[network]
url = "http://localhost:18515"

[watchdog]
url = "http://localhost:18516"

[chains.BTC]
kind = "utxo"
priority_code = 0
network = "regtest"
api_url = "http://localhost:3002"
private_key_env = "BTC_KEY"

[chains.ETH]
kind = "account"
priority_code = 1
chain_id = 1337
rpc_urls = ["http://localhost:8545"]
contract_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
private_key_env = "ETH_KEY"
"#,
        )
        .unwrap();

        let mut keystore = MockKeystore::new();
        keystore.expect_get_key().returning(|_| {
            Ok(Key::Utxo(PrivateKey::new(
                SecretKey::from_slice(&[1; 32]).unwrap(),
                Network::Regtest,
            )))
        });

        let clock = Arc::new(ManualClock::new(0));
        assert!(matches!(
            ChainRegistry::from_settings(&settings, &keystore, clock),
            Err(SwapperError::Config(_))
        ));
    }
}
