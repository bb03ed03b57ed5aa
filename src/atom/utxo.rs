//! HTLC binder for UTXO chains
//!
//! The contract is a P2SH output locked by the HTLC script. Initiation funds it
//! from the wallet's P2PKH outputs and pre-signs a refund transaction. Redeem
//! and refund spends are checked against consensus rules before broadcast.

use super::{poll, Atom, AtomError, AuditReport};
use crate::chain::{Utxo, UtxoConnector};
use crate::clock::Clock;
use crate::config::UtxoChainConfig;
use crate::script::{
    build_htlc_script, build_p2pkh_sig_script, build_redeem_sig_script, build_refund_sig_script,
    extract_htlc_fields, extract_secret, verify_p2sh_spend, HtlcFields, ScriptError, Secret,
    SecretHash,
};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, PrivateKey, PublicKey, Script, ScriptBuf, ScriptHash,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use ethers::types::U256;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Outputs below this are not relayed; change this small goes to fees
pub const DUST_LIMIT: u64 = 546;

const CONFIRMATION_POLLS: u32 = 60;

/// Contract state exchanged with the counterparty and persisted for resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoDetails {
    #[serde(with = "hex::serde")]
    pub contract: Vec<u8>,
    pub contract_txid: Txid,
    pub contract_vout: u32,
    pub value: u64,
    /// Signed refund spend; only present on the initiator's side
    #[serde(default, with = "hex::serde")]
    pub refund_tx: Vec<u8>,
}

impl UtxoDetails {
    fn contract_script(&self) -> &Script {
        Script::from_bytes(&self.contract)
    }

    fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.contract_txid, self.contract_vout)
    }

    fn contract_output(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.value),
            script_pubkey: p2sh_script(self.contract_script()),
        }
    }
}

pub struct UtxoAtom {
    chain: String,
    priority_code: u32,
    network: Network,
    fee_sats: u64,
    min_confirmations: u32,
    poll_interval: Duration,
    connector: Arc<dyn UtxoConnector>,
    key: PrivateKey,
    secp: Secp256k1<All>,
    clock: Arc<dyn Clock>,
    details: RwLock<Option<UtxoDetails>>,
}

impl UtxoAtom {
    pub fn new(
        chain: &str,
        config: &UtxoChainConfig,
        connector: Arc<dyn UtxoConnector>,
        key: PrivateKey,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            priority_code: config.priority_code,
            network: config.network,
            fee_sats: config.fee_sats,
            min_confirmations: config.min_confirmations,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            connector,
            key,
            secp: Secp256k1::new(),
            clock,
            details: RwLock::new(None),
        }
    }

    fn public_key(&self) -> PublicKey {
        self.key.public_key(&self.secp)
    }

    fn pubkey_hash(&self) -> [u8; 20] {
        self.public_key().pubkey_hash().to_byte_array()
    }

    /// Wallet address change and spends are paid to
    pub fn address(&self) -> Address {
        Address::p2pkh(self.public_key(), self.network)
    }

    fn loaded(&self) -> Result<UtxoDetails, AtomError> {
        self.details.read().clone().ok_or(AtomError::NotLoaded)
    }

    fn p2sh_address(&self, contract: &Script) -> Result<Address, AtomError> {
        Address::p2sh(contract, self.network).map_err(|e| AtomError::InvalidDetails(e.to_string()))
    }

    fn to_sats(&self, value: U256) -> Result<u64, AtomError> {
        if value > U256::from(u64::MAX) {
            return Err(AtomError::ValueOutOfRange(value.to_string()));
        }
        Ok(value.as_u64())
    }

    fn sign_input(
        &self,
        tx: &Transaction,
        index: usize,
        script_code: &Script,
    ) -> Result<Vec<u8>, AtomError> {
        let sighash = SighashCache::new(tx)
            .legacy_signature_hash(index, script_code, EcdsaSighashType::All.to_u32())
            .map_err(|e| AtomError::Signing(e.to_string()))?;
        let message = Message::from_digest(sighash.to_byte_array());
        let signature = self.secp.sign_ecdsa(&message, &self.key.inner);
        Ok(ecdsa::Signature {
            signature,
            sighash_type: EcdsaSighashType::All,
        }
        .to_vec())
    }

    /// Single-input spend of the contract output back to the wallet
    fn contract_spend(
        &self,
        details: &UtxoDetails,
        lock_time: LockTime,
        sequence: Sequence,
    ) -> Result<Transaction, AtomError> {
        let value = details
            .value
            .checked_sub(self.fee_sats)
            .filter(|v| *v >= DUST_LIMIT)
            .ok_or_else(|| AtomError::ValueOutOfRange(details.value.to_string()))?;

        Ok(Transaction {
            version: Version::TWO,
            lock_time,
            input: vec![TxIn {
                previous_output: details.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: self.address().script_pubkey(),
            }],
        })
    }

    fn build_refund(&self, details: &UtxoDetails, lock_time: i64) -> Result<Transaction, AtomError> {
        let lock_time = u32::try_from(lock_time)
            .map_err(|_| AtomError::ValueOutOfRange(lock_time.to_string()))?;
        let mut tx = self.contract_spend(
            details,
            LockTime::from_consensus(lock_time),
            Sequence::ZERO,
        )?;

        let contract = details.contract_script();
        let sig = self.sign_input(&tx, 0, contract)?;
        tx.input[0].script_sig =
            build_refund_sig_script(contract, &sig, &self.public_key().to_bytes())?;
        verify_p2sh_spend(&tx, 0, &details.contract_output())?;
        Ok(tx)
    }

    fn build_redeem(&self, details: &UtxoDetails, secret: &Secret) -> Result<Transaction, AtomError> {
        let mut tx = self.contract_spend(details, LockTime::ZERO, Sequence::MAX)?;

        let contract = details.contract_script();
        let sig = self.sign_input(&tx, 0, contract)?;
        tx.input[0].script_sig =
            build_redeem_sig_script(contract, &sig, &self.public_key().to_bytes(), secret)?;
        verify_p2sh_spend(&tx, 0, &details.contract_output())?;
        Ok(tx)
    }

    /// Contract funding transaction paying `amount` to the P2SH output
    async fn build_funding(
        &self,
        contract_script_pubkey: ScriptBuf,
        amount: u64,
    ) -> Result<Transaction, AtomError> {
        let own_address = self.address();
        let need = amount + self.fee_sats;

        let mut selected: Vec<Utxo> = Vec::new();
        let mut total = 0u64;
        for utxo in self.connector.unspent_outputs(&own_address).await? {
            if total >= need {
                break;
            }
            total += utxo.value.to_sat();
            selected.push(utxo);
        }
        if total < need {
            return Err(AtomError::InsufficientFunds {
                have: U256::from(total),
                need: U256::from(need),
            });
        }

        let mut output = vec![TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: contract_script_pubkey,
        }];
        let change = total - need;
        if change >= DUST_LIMIT {
            output.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: own_address.script_pubkey(),
            });
        }

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: selected
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output,
        };

        let signatures = selected
            .iter()
            .enumerate()
            .map(|(index, utxo)| self.sign_input(&tx, index, &utxo.script_pubkey))
            .collect::<Result<Vec<_>, _>>()?;
        let public_key = self.public_key();
        for (input, sig) in tx.input.iter_mut().zip(signatures) {
            input.script_sig = build_p2pkh_sig_script(&sig, &public_key)?;
        }

        Ok(tx)
    }

    /// Existing output paying to the contract, if this swap was already funded
    async fn find_contract_output(
        &self,
        contract: &Script,
    ) -> Result<Option<(Txid, u32, u64)>, AtomError> {
        let script_pubkey = p2sh_script(contract);
        let transactions = self
            .connector
            .address_transactions(&self.p2sh_address(contract)?)
            .await?;

        Ok(transactions.iter().find_map(|tx| {
            tx.output
                .iter()
                .position(|out| out.script_pubkey == script_pubkey)
                .map(|vout| (tx.compute_txid(), vout as u32, tx.output[vout].value.to_sat()))
        }))
    }

    /// Transaction spending the contract output and the index of that input
    async fn find_spend(&self, details: &UtxoDetails) -> Result<Option<(Transaction, usize)>, AtomError> {
        let outpoint = details.outpoint();
        let transactions = self
            .connector
            .address_transactions(&self.p2sh_address(details.contract_script())?)
            .await?;

        Ok(transactions.into_iter().find_map(|tx| {
            let index = tx
                .input
                .iter()
                .position(|input| input.previous_output == outpoint)?;
            Some((tx, index))
        }))
    }

    async fn broadcast_and_confirm(&self, tx: &Transaction) -> Result<Txid, AtomError> {
        let txid = self.connector.broadcast(tx).await?;
        info!("{}: broadcast {}", self.chain, txid);

        let wanted = self.min_confirmations;
        let (connector, chain) = (&self.connector, &self.chain);
        let confirmed = poll(self.poll_interval, CONFIRMATION_POLLS, || async move {
            let confirmations = connector.confirmations(&txid).await?;
            debug!("{}: {} has {}/{} confirmations", chain, txid, confirmations, wanted);
            Ok((confirmations >= wanted).then_some(()))
        })
        .await?;

        confirmed
            .map(|_| txid)
            .ok_or_else(|| AtomError::Unconfirmed(txid.to_string()))
    }

    fn fields(details: &UtxoDetails) -> Result<HtlcFields, AtomError> {
        extract_htlc_fields(details.contract_script()).map_err(|e| match e {
            ScriptError::NotAnHtlc => {
                AtomError::MalformedContract(ScriptError::NotAnHtlc.to_string())
            }
            other => AtomError::Script(other),
        })
    }
}

fn p2sh_script(contract: &Script) -> ScriptBuf {
    ScriptBuf::new_p2sh(&ScriptHash::hash(contract.as_bytes()))
}

#[async_trait]
impl Atom for UtxoAtom {
    fn priority_code(&self) -> u32 {
        self.priority_code
    }

    fn recipient_id(&self, address: &str) -> Result<Vec<u8>, AtomError> {
        let invalid = |reason: String| AtomError::InvalidAddress {
            address: address.to_string(),
            reason,
        };
        let address = Address::from_str(address)
            .map_err(|e| invalid(e.to_string()))?
            .require_network(self.network)
            .map_err(|e| invalid(e.to_string()))?;
        let pubkey_hash = address
            .pubkey_hash()
            .ok_or_else(|| invalid("not a pay-to-pubkey-hash address".to_string()))?;
        Ok(pubkey_hash.to_byte_array().to_vec())
    }

    async fn initiate(
        &self,
        to: &str,
        secret_hash: SecretHash,
        value: U256,
        expiry: i64,
    ) -> Result<(), AtomError> {
        let redeemer: [u8; 20] = self
            .recipient_id(to)?
            .try_into()
            .map_err(|_| AtomError::InvalidAddress {
                address: to.to_string(),
                reason: "pubkey hash is not 20 bytes".to_string(),
            })?;
        let amount = self.to_sats(value)?;
        if amount < self.fee_sats + DUST_LIMIT {
            return Err(AtomError::ValueOutOfRange(value.to_string()));
        }

        let contract = build_htlc_script(&redeemer, &self.pubkey_hash(), expiry, &secret_hash);

        if let Some((txid, vout, funded)) = self.find_contract_output(&contract).await? {
            info!("{}: contract already funded by {}", self.chain, txid);
            let mut details = UtxoDetails {
                contract: contract.to_bytes(),
                contract_txid: txid,
                contract_vout: vout,
                value: funded,
                refund_tx: Vec::new(),
            };
            details.refund_tx = serialize(&self.build_refund(&details, expiry)?);
            *self.details.write() = Some(details);
            return Ok(());
        }

        let funding = self.build_funding(p2sh_script(&contract), amount).await?;
        let mut details = UtxoDetails {
            contract: contract.to_bytes(),
            contract_txid: funding.compute_txid(),
            contract_vout: 0,
            value: amount,
            refund_tx: Vec::new(),
        };
        details.refund_tx = serialize(&self.build_refund(&details, expiry)?);
        *self.details.write() = Some(details);

        self.broadcast_and_confirm(&funding).await?;
        Ok(())
    }

    async fn audit(&self) -> Result<AuditReport, AtomError> {
        let details = self.loaded()?;
        let fields = Self::fields(&details)?;

        let tx = self
            .connector
            .transaction(&details.contract_txid)
            .await?
            .ok_or(AtomError::ContractNotFound)?;
        let output = tx
            .output
            .get(details.contract_vout as usize)
            .filter(|out| out.script_pubkey == p2sh_script(details.contract_script()))
            .ok_or_else(|| {
                AtomError::MalformedContract(format!(
                    "{}:{} does not pay to the contract",
                    details.contract_txid, details.contract_vout
                ))
            })?;

        let confirmations = self.connector.confirmations(&details.contract_txid).await?;
        if confirmations < self.min_confirmations {
            return Err(AtomError::Unconfirmed(details.contract_txid.to_string()));
        }

        Ok(AuditReport {
            secret_hash: fields.secret_hash,
            recipient: fields.redeemer.to_vec(),
            value: U256::from(output.value.to_sat()),
            expiry: fields.lock_time,
        })
    }

    async fn audit_secret(&self) -> Result<Secret, AtomError> {
        let details = self.loaded()?;
        let fields = Self::fields(&details)?;

        let (spend, index) = self
            .find_spend(&details)
            .await?
            .ok_or(AtomError::NotYetRevealed)?;
        Ok(extract_secret(&spend.input[index].script_sig, &fields.secret_hash)?)
    }

    async fn redeem(&self, secret: &Secret) -> Result<(), AtomError> {
        let details = self.loaded()?;
        let fields = Self::fields(&details)?;

        if fields.redeemer != self.pubkey_hash() {
            return Err(AtomError::InvalidDetails(
                "contract is not redeemable by this wallet".to_string(),
            ));
        }
        if secret.hash() != fields.secret_hash {
            return Err(AtomError::SecretMismatch);
        }
        if self.find_spend(&details).await?.is_some() {
            return Err(AtomError::AlreadyRedeemedOrRefunded);
        }

        let tx = self.build_redeem(&details, secret)?;
        self.broadcast_and_confirm(&tx).await?;
        Ok(())
    }

    async fn refund(&self) -> Result<(), AtomError> {
        let details = self.loaded()?;
        let fields = Self::fields(&details)?;

        if details.refund_tx.is_empty() {
            return Err(AtomError::InvalidDetails("no refund transaction".to_string()));
        }
        if self.clock.now() < fields.lock_time {
            return Err(AtomError::NotExpired {
                expiry: fields.lock_time,
            });
        }
        if self.find_spend(&details).await?.is_some() {
            return Err(AtomError::AlreadyRedeemedOrRefunded);
        }

        let tx: Transaction = deserialize(&details.refund_tx)
            .map_err(|e| AtomError::InvalidDetails(e.to_string()))?;
        verify_p2sh_spend(&tx, 0, &details.contract_output())?;
        self.broadcast_and_confirm(&tx).await?;
        Ok(())
    }

    fn serialize(&self) -> Result<Vec<u8>, AtomError> {
        let details = self.loaded()?;
        serde_json::to_vec(&details).map_err(|e| AtomError::InvalidDetails(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<(), AtomError> {
        let details: UtxoDetails =
            serde_json::from_slice(bytes).map_err(|e| AtomError::InvalidDetails(e.to_string()))?;
        *self.details.write() = Some(details);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::sim::SimUtxoChain;
    use crate::clock::ManualClock;
    use bitcoin::secp256k1::SecretKey;

    const NOW: i64 = 1_700_000_000;
    const EXPIRY: i64 = NOW + 48 * 3600;

    fn config() -> UtxoChainConfig {
        UtxoChainConfig {
            priority_code: 0,
            network: Network::Regtest,
            api_url: String::new(),
            fee_sats: 10_000,
            min_confirmations: 1,
            poll_interval_ms: 1,
            private_key_env: String::new(),
        }
    }

    fn atom(chain: &Arc<SimUtxoChain>, clock: &Arc<ManualClock>, seed: u8) -> UtxoAtom {
        let key = PrivateKey::new(SecretKey::from_slice(&[seed; 32]).unwrap(), Network::Regtest);
        UtxoAtom::new("BTC", &config(), chain.clone(), key, clock.clone())
    }

    struct Fixture {
        chain: Arc<SimUtxoChain>,
        clock: Arc<ManualClock>,
        alice: UtxoAtom,
        bob: UtxoAtom,
        secret: Secret,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(NOW));
        let chain = SimUtxoChain::new(clock.clone());
        let alice = atom(&chain, &clock, 0x0a);
        let bob = atom(&chain, &clock, 0x0b);
        chain.fund(&alice.address(), 2_000_000);
        chain.fund(&alice.address(), 2_000_000);
        Fixture {
            chain,
            clock,
            alice,
            bob,
            secret: Secret::from_bytes([0x5e; 32]),
        }
    }

    async fn initiate(f: &Fixture) {
        f.alice
            .initiate(
                &f.bob.address().to_string(),
                f.secret.hash(),
                U256::from(3_000_000u64),
                EXPIRY,
            )
            .await
            .unwrap();
    }

    fn foreign_view(f: &Fixture) -> UtxoAtom {
        let view = atom(&f.chain, &f.clock, 0x0b);
        view.deserialize(&f.alice.serialize().unwrap()).unwrap();
        view
    }

    #[tokio::test]
    async fn test_initiate_and_audit() {
        let f = fixture();
        initiate(&f).await;

        let report = foreign_view(&f).audit().await.unwrap();
        assert_eq!(report.secret_hash, f.secret.hash());
        assert_eq!(report.recipient, f.bob.recipient_id(&f.bob.address().to_string()).unwrap());
        assert_eq!(report.value, U256::from(3_000_000u64));
        assert_eq!(report.expiry, EXPIRY);
    }

    #[tokio::test]
    async fn test_initiate_is_idempotent() {
        let f = fixture();
        initiate(&f).await;
        let first = f.alice.serialize().unwrap();
        let broadcasts = f.chain.broadcast_count();

        initiate(&f).await;
        assert_eq!(f.chain.broadcast_count(), broadcasts);
        assert_eq!(f.alice.serialize().unwrap(), first);
    }

    #[tokio::test]
    async fn test_initiate_insufficient_funds() {
        let f = fixture();
        let err = f
            .alice
            .initiate(
                &f.bob.address().to_string(),
                f.secret.hash(),
                U256::from(10_000_000u64),
                EXPIRY,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AtomError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_audit_missing_contract() {
        let f = fixture();
        let contract = build_htlc_script(&[1; 20], &[2; 20], EXPIRY, &f.secret.hash());
        let details = UtxoDetails {
            contract: contract.to_bytes(),
            contract_txid: Txid::all_zeros(),
            contract_vout: 0,
            value: 3_000_000,
            refund_tx: Vec::new(),
        };
        f.bob.deserialize(&serde_json::to_vec(&details).unwrap()).unwrap();
        assert!(matches!(f.bob.audit().await, Err(AtomError::ContractNotFound)));
    }

    #[tokio::test]
    async fn test_audit_wrong_output_is_malformed() {
        let f = fixture();
        initiate(&f).await;

        let mut details: UtxoDetails = serde_json::from_slice(&f.alice.serialize().unwrap()).unwrap();
        details.contract_vout = 1;
        f.bob.deserialize(&serde_json::to_vec(&details).unwrap()).unwrap();
        assert!(matches!(f.bob.audit().await, Err(AtomError::MalformedContract(_))));
    }

    #[tokio::test]
    async fn test_redeem_reveals_secret() {
        let f = fixture();
        initiate(&f).await;

        assert!(matches!(f.alice.audit_secret().await, Err(AtomError::NotYetRevealed)));

        let view = foreign_view(&f);
        view.redeem(&f.secret).await.unwrap();
        assert_eq!(f.alice.audit_secret().await.unwrap(), f.secret);

        assert!(matches!(
            view.redeem(&f.secret).await,
            Err(AtomError::AlreadyRedeemedOrRefunded)
        ));
        assert!(matches!(
            f.alice.refund().await,
            Err(AtomError::NotExpired { .. }) | Err(AtomError::AlreadyRedeemedOrRefunded)
        ));
    }

    #[tokio::test]
    async fn test_redeem_rejects_wrong_secret_and_wallet() {
        let f = fixture();
        initiate(&f).await;

        let view = foreign_view(&f);
        assert!(matches!(
            view.redeem(&Secret::from_bytes([0; 32])).await,
            Err(AtomError::SecretMismatch)
        ));

        let stranger = atom(&f.chain, &f.clock, 0x0c);
        stranger.deserialize(&f.alice.serialize().unwrap()).unwrap();
        assert!(matches!(
            stranger.redeem(&f.secret).await,
            Err(AtomError::InvalidDetails(_))
        ));
    }

    #[tokio::test]
    async fn test_refund_after_expiry() {
        let f = fixture();
        initiate(&f).await;

        assert!(matches!(
            f.alice.refund().await,
            Err(AtomError::NotExpired { expiry: EXPIRY })
        ));

        f.clock.advance(48 * 3600);
        f.alice.refund().await.unwrap();
        assert!(matches!(
            f.alice.refund().await,
            Err(AtomError::AlreadyRedeemedOrRefunded)
        ));
        assert!(matches!(
            foreign_view(&f).redeem(&f.secret).await,
            Err(AtomError::AlreadyRedeemedOrRefunded)
        ));
    }

    #[test]
    fn test_recipient_id_rejects_foreign_network() {
        let clock = Arc::new(ManualClock::new(NOW));
        let chain = SimUtxoChain::new(clock.clone());
        let atom = atom(&chain, &clock, 0x0a);

        assert!(matches!(
            atom.recipient_id("1BoatSLRHtKNngkdXEeobR76b53LETtpyT"),
            Err(AtomError::InvalidAddress { .. })
        ));
        assert!(matches!(
            atom.recipient_id("not an address"),
            Err(AtomError::InvalidAddress { .. })
        ));
    }
}
