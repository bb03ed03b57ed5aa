//! In-process chains for binder and end-to-end tests
//!
//! `SimUtxoChain` keeps a transaction graph and runs the consensus check on
//! every contract spend. `SimAccountChain` executes the swap contract's calls
//! against an in-memory ledger and produces receipts.

use crate::chain::{AccountConnector, ConnectorError, Utxo, UtxoConnector};
use crate::clock::Clock;
use crate::script::{sha256, verify_p2sh_spend, ContractAudit, SwapCall};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as AccountAddress, Bytes, TransactionReceipt, H256, U256, U64};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct UtxoLedger {
    transactions: HashMap<Txid, Transaction>,
    order: Vec<Txid>,
    outputs: HashMap<OutPoint, TxOut>,
    spent: HashSet<OutPoint>,
    broadcasts: usize,
}

pub(crate) struct SimUtxoChain {
    clock: Arc<dyn Clock>,
    ledger: Mutex<UtxoLedger>,
}

impl SimUtxoChain {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            ledger: Mutex::new(UtxoLedger::default()),
        })
    }

    /// Mint an output paying `sats` to `address`
    pub fn fund(&self, address: &Address, sats: u64) -> OutPoint {
        let mut ledger = self.ledger.lock();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(ledger.order.len().to_le_bytes().to_vec()),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(sats),
                script_pubkey: address.script_pubkey(),
            }],
        };
        Self::apply(&mut ledger, tx).0
    }

    pub fn broadcast_count(&self) -> usize {
        self.ledger.lock().broadcasts
    }

    pub fn balance(&self, address: &Address) -> u64 {
        let script_pubkey = address.script_pubkey();
        let ledger = self.ledger.lock();
        ledger
            .outputs
            .iter()
            .filter(|(outpoint, out)| {
                out.script_pubkey == script_pubkey && !ledger.spent.contains(*outpoint)
            })
            .map(|(_, out)| out.value.to_sat())
            .sum()
    }

    fn apply(ledger: &mut UtxoLedger, tx: Transaction) -> (OutPoint, Txid) {
        let txid = tx.compute_txid();
        for input in &tx.input {
            ledger.spent.insert(input.previous_output);
        }
        for (vout, out) in tx.output.iter().enumerate() {
            ledger.outputs.insert(OutPoint::new(txid, vout as u32), out.clone());
        }
        ledger.order.push(txid);
        ledger.transactions.insert(txid, tx);
        (OutPoint::new(txid, 0), txid)
    }

    fn check(&self, ledger: &UtxoLedger, tx: &Transaction) -> Result<(), ConnectorError> {
        let non_final = tx.input.iter().any(|input| input.sequence != Sequence::MAX);
        if non_final && i64::from(tx.lock_time.to_consensus_u32()) > self.clock.now() {
            return Err(ConnectorError::Rejected("non-final".to_string()));
        }

        for (index, input) in tx.input.iter().enumerate() {
            if ledger.spent.contains(&input.previous_output) {
                return Err(ConnectorError::Rejected("input already spent".to_string()));
            }
            let prevout = ledger
                .outputs
                .get(&input.previous_output)
                .ok_or_else(|| ConnectorError::Rejected("missing input".to_string()))?;
            if prevout.script_pubkey.is_p2sh() {
                verify_p2sh_spend(tx, index, prevout)
                    .map_err(|e| ConnectorError::Rejected(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UtxoConnector for SimUtxoChain {
    async fn unspent_outputs(&self, address: &Address) -> Result<Vec<Utxo>, ConnectorError> {
        let script_pubkey = address.script_pubkey();
        let ledger = self.ledger.lock();
        let mut utxos: Vec<Utxo> = ledger
            .order
            .iter()
            .flat_map(|txid| {
                ledger.transactions[txid]
                    .output
                    .iter()
                    .enumerate()
                    .map(move |(vout, out)| (OutPoint::new(*txid, vout as u32), out))
            })
            .filter(|(outpoint, out)| {
                out.script_pubkey == script_pubkey && !ledger.spent.contains(outpoint)
            })
            .map(|(outpoint, out)| Utxo {
                outpoint,
                value: out.value,
                script_pubkey: out.script_pubkey.clone(),
            })
            .collect();
        utxos.sort_by_key(|u| std::cmp::Reverse(u.value));
        Ok(utxos)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ConnectorError> {
        let mut ledger = self.ledger.lock();
        self.check(&ledger, tx)?;
        ledger.broadcasts += 1;
        Ok(Self::apply(&mut ledger, tx.clone()).1)
    }

    async fn transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ConnectorError> {
        Ok(self.ledger.lock().transactions.get(txid).cloned())
    }

    async fn address_transactions(
        &self,
        address: &Address,
    ) -> Result<Vec<Transaction>, ConnectorError> {
        let script_pubkey = address.script_pubkey();
        let ledger = self.ledger.lock();
        let touches = |tx: &Transaction| {
            tx.output.iter().any(|out| out.script_pubkey == script_pubkey)
                || tx.input.iter().any(|input| {
                    ledger
                        .outputs
                        .get(&input.previous_output)
                        .is_some_and(|prev| prev.script_pubkey == script_pubkey)
                })
        };
        Ok(ledger
            .order
            .iter()
            .map(|txid| &ledger.transactions[txid])
            .filter(|tx| touches(*tx))
            .cloned()
            .collect())
    }

    async fn confirmations(&self, txid: &Txid) -> Result<u32, ConnectorError> {
        let ledger = self.ledger.lock();
        Ok(ledger
            .order
            .iter()
            .position(|known| known == txid)
            .map(|height| (ledger.order.len() - height) as u32)
            .unwrap_or(0))
    }
}

#[derive(Clone)]
struct SimSwap {
    initiator: AccountAddress,
    recipient: AccountAddress,
    value: U256,
    secret_hash: [u8; 32],
    expiry: U256,
    secret: Option<[u8; 32]>,
    closed: bool,
}

#[derive(Default)]
struct AccountLedger {
    balances: HashMap<AccountAddress, U256>,
    swaps: HashMap<[u8; 32], SimSwap>,
    receipts: HashMap<H256, TransactionReceipt>,
    sent: u64,
}

/// Account chain hosting a single swap contract
pub(crate) struct SimAccountChain {
    contract: AccountAddress,
    clock: Arc<dyn Clock>,
    ledger: Mutex<AccountLedger>,
}

impl SimAccountChain {
    pub fn new(contract: AccountAddress, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            contract,
            clock,
            ledger: Mutex::new(AccountLedger::default()),
        })
    }

    pub fn fund(&self, address: AccountAddress, value: U256) {
        *self.ledger.lock().balances.entry(address).or_default() += value;
    }

    pub fn balance_of(&self, address: AccountAddress) -> U256 {
        self.ledger
            .lock()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    pub fn sent_count(&self) -> u64 {
        self.ledger.lock().sent
    }

    /// Connector sending from `address`; it cannot sign messages
    pub fn connector(self: &Arc<Self>, address: AccountAddress) -> Arc<SimAccountConnector> {
        Arc::new(SimAccountConnector {
            chain: self.clone(),
            address,
            wallet: None,
        })
    }

    /// Connector sending from and signing with `wallet`
    pub fn wallet_connector(self: &Arc<Self>, wallet: LocalWallet) -> Arc<SimAccountConnector> {
        Arc::new(SimAccountConnector {
            chain: self.clone(),
            address: wallet.address(),
            wallet: Some(wallet),
        })
    }

    fn decode(&self, tx: &TypedTransaction) -> Result<SwapCall, ConnectorError> {
        if tx.to_addr() != Some(&self.contract) {
            return Err(ConnectorError::Rejected("no contract at address".to_string()));
        }
        let data = tx.data().cloned().unwrap_or_default();
        SwapCall::decode(&data).map_err(|e| ConnectorError::Decode(e.to_string()))
    }

    /// Apply a state-changing call; `false` means the call reverted
    fn execute(ledger: &mut AccountLedger, now: i64, from: AccountAddress, value: U256, call: SwapCall) -> bool {
        match call {
            SwapCall::Initiate {
                swap_id,
                recipient,
                secret_hash,
                expiry,
            } => {
                let balance = ledger.balances.entry(from).or_default();
                if ledger_has(&ledger.swaps, &swap_id) || value.is_zero() || *balance < value {
                    return false;
                }
                *balance -= value;
                ledger.swaps.insert(
                    swap_id,
                    SimSwap {
                        initiator: from,
                        recipient,
                        value,
                        secret_hash,
                        expiry,
                        secret: None,
                        closed: false,
                    },
                );
                true
            }
            SwapCall::Redeem { swap_id, secret } => {
                let Some(swap) = ledger.swaps.get_mut(&swap_id) else {
                    return false;
                };
                if swap.closed || sha256(secret.as_bytes()) != swap.secret_hash {
                    return false;
                }
                swap.closed = true;
                swap.secret = Some(*secret.as_bytes());
                let (recipient, value) = (swap.recipient, swap.value);
                *ledger.balances.entry(recipient).or_default() += value;
                true
            }
            SwapCall::Refund { swap_id } => {
                let Some(swap) = ledger.swaps.get_mut(&swap_id) else {
                    return false;
                };
                if swap.closed || U256::from(now.max(0) as u64) < swap.expiry {
                    return false;
                }
                swap.closed = true;
                let (initiator, value) = (swap.initiator, swap.value);
                *ledger.balances.entry(initiator).or_default() += value;
                true
            }
            _ => false,
        }
    }

    fn submit(&self, from: AccountAddress, tx: TypedTransaction) -> Result<H256, ConnectorError> {
        let call = self.decode(&tx)?;
        let value = tx.value().copied().unwrap_or_default();
        let now = self.clock.now();

        let mut ledger = self.ledger.lock();
        ledger.sent += 1;
        let hash = H256::from_low_u64_be(ledger.sent);
        let success = Self::execute(&mut ledger, now, from, value, call);
        ledger.receipts.insert(
            hash,
            TransactionReceipt {
                transaction_hash: hash,
                from,
                to: Some(self.contract),
                status: Some(U64::from(u64::from(success))),
                ..Default::default()
            },
        );
        Ok(hash)
    }

    fn query(&self, tx: &TypedTransaction) -> Result<Bytes, ConnectorError> {
        let call = self.decode(tx)?;
        let now = U256::from(self.clock.now().max(0) as u64);
        let ledger = self.ledger.lock();

        let output = match call {
            SwapCall::Audit { swap_id } => {
                let audit = match ledger.swaps.get(&swap_id) {
                    Some(swap) => ContractAudit {
                        expiry: swap.expiry,
                        value: swap.value,
                        recipient: swap.recipient,
                        initiator: swap.initiator,
                        secret_hash: swap.secret_hash,
                    },
                    None => ContractAudit {
                        expiry: U256::zero(),
                        value: U256::zero(),
                        recipient: AccountAddress::zero(),
                        initiator: AccountAddress::zero(),
                        secret_hash: [0; 32],
                    },
                };
                audit.encode()
            }
            SwapCall::AuditSecret { swap_id } => crate::script::contract::encode_bytes32(
                &ledger
                    .swaps
                    .get(&swap_id)
                    .and_then(|swap| swap.secret)
                    .unwrap_or([0; 32]),
            ),
            SwapCall::Initiatable { swap_id } => {
                crate::script::contract::encode_bool(!ledger_has(&ledger.swaps, &swap_id))
            }
            SwapCall::Redeemable { swap_id } => crate::script::contract::encode_bool(
                ledger.swaps.get(&swap_id).is_some_and(|swap| !swap.closed),
            ),
            SwapCall::Refundable { swap_id } => crate::script::contract::encode_bool(
                ledger
                    .swaps
                    .get(&swap_id)
                    .is_some_and(|swap| !swap.closed && now >= swap.expiry),
            ),
            other => {
                return Err(ConnectorError::Rejected(format!(
                    "{:?} is not a view call",
                    other
                )))
            }
        };
        Ok(output)
    }
}

fn ledger_has(swaps: &HashMap<[u8; 32], SimSwap>, swap_id: &[u8; 32]) -> bool {
    swaps.contains_key(swap_id)
}

pub(crate) struct SimAccountConnector {
    chain: Arc<SimAccountChain>,
    address: AccountAddress,
    wallet: Option<LocalWallet>,
}

#[async_trait]
impl AccountConnector for SimAccountConnector {
    fn address(&self) -> AccountAddress {
        self.address
    }

    async fn send_transaction(&self, tx: TypedTransaction) -> Result<H256, ConnectorError> {
        self.chain.submit(self.address, tx)
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ConnectorError> {
        self.chain.query(tx)
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ConnectorError> {
        Ok(self.chain.ledger.lock().receipts.get(&hash).cloned())
    }

    async fn balance(&self) -> Result<U256, ConnectorError> {
        Ok(self.chain.balance_of(self.address))
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        let wallet = self
            .wallet
            .as_ref()
            .ok_or_else(|| ConnectorError::Signing(format!("no key for {:?}", self.address)))?;
        let signature = wallet
            .sign_message(message)
            .await
            .map_err(|e| ConnectorError::Signing(e.to_string()))?;
        Ok(signature.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use bitcoin::Network;

    #[tokio::test]
    async fn test_utxo_chain_rejects_unknown_input() {
        let clock = Arc::new(ManualClock::new(0));
        let chain = SimUtxoChain::new(clock);
        let address = Address::p2sh(&ScriptBuf::from_bytes(vec![0x51]), Network::Regtest).unwrap();
        let outpoint = chain.fund(&address, 1_000);

        let spend = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 7),
                ..Default::default()
            }],
            output: vec![],
        };
        assert!(chain.broadcast(&spend).await.is_err());
        assert_eq!(chain.balance(&address), 1_000);
        assert_eq!(chain.confirmations(&outpoint.txid).await.unwrap(), 1);
    }
}
