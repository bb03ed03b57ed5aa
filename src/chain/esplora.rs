//! Esplora-backed connector for UTXO chains

use super::{ConnectorError, Utxo, UtxoConnector};

use async_trait::async_trait;
use bitcoin::{Address, OutPoint, Transaction, Txid};
use esplora_client::{AsyncClient, Builder};
use std::collections::HashSet;
use tracing::debug;

/// Esplora returns confirmed history in pages of this size
const CONFIRMED_PAGE: usize = 25;

const TIMEOUT_SECS: u64 = 30;

impl From<esplora_client::Error> for ConnectorError {
    fn from(e: esplora_client::Error) -> Self {
        match e {
            esplora_client::Error::HttpResponse { status: 400, message } => {
                ConnectorError::Rejected(message)
            }
            esplora_client::Error::Reqwest(e) => ConnectorError::Http(e.to_string()),
            esplora_client::Error::HttpResponse { status, message } => {
                ConnectorError::Http(format!("{}: {}", status, message))
            }
            e => ConnectorError::Decode(e.to_string()),
        }
    }
}

fn not_found(e: &esplora_client::Error) -> bool {
    matches!(e, esplora_client::Error::HttpResponse { status: 404, .. })
}

/// Connector backed by an Esplora-compatible HTTP API
pub struct EsploraClient {
    chain: String,
    client: AsyncClient,
}

impl EsploraClient {
    /// Create a client for `base_url`, e.g. `https://blockstream.info/testnet/api`
    pub fn new(chain: &str, base_url: &str) -> Result<Self, ConnectorError> {
        let client = Builder::new(base_url.trim_end_matches('/'))
            .timeout(TIMEOUT_SECS)
            .build_async()
            .map_err(|e| ConnectorError::Invalid(e.to_string()))?;

        Ok(Self {
            chain: chain.to_string(),
            client,
        })
    }

    /// Full history of `address`, newest first, mempool included
    async fn history(&self, address: &Address) -> Result<Vec<esplora_client::Tx>, ConnectorError> {
        let script_pubkey = address.script_pubkey();
        let mut history = Vec::new();
        let mut last_seen = None;

        loop {
            let page = self.client.scripthash_txs(&script_pubkey, last_seen).await?;
            let confirmed = page.iter().filter(|tx| tx.status.confirmed).count();
            last_seen = page.iter().rev().find(|tx| tx.status.confirmed).map(|tx| tx.txid);
            history.extend(page);

            if confirmed < CONFIRMED_PAGE || last_seen.is_none() {
                break;
            }
        }
        Ok(history)
    }
}

#[async_trait]
impl UtxoConnector for EsploraClient {
    /// Unspent outputs derived from the address history
    async fn unspent_outputs(&self, address: &Address) -> Result<Vec<Utxo>, ConnectorError> {
        let script_pubkey = address.script_pubkey();
        let history: Vec<Transaction> = self
            .history(address)
            .await?
            .iter()
            .map(|tx| tx.to_tx())
            .collect();
        Ok(unspent(&history, &script_pubkey))
    }

    /// Submit `tx` and return its id
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ConnectorError> {
        self.client.broadcast(tx).await?;
        let txid = tx.compute_txid();
        debug!("Broadcast {} on {}", txid, self.chain);
        Ok(txid)
    }

    /// Fetch a transaction, `None` if the explorer does not know it
    async fn transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ConnectorError> {
        Ok(self.client.get_tx(txid).await?)
    }

    /// Every transaction touching `address`
    async fn address_transactions(
        &self,
        address: &Address,
    ) -> Result<Vec<Transaction>, ConnectorError> {
        Ok(self.history(address).await?.iter().map(|tx| tx.to_tx()).collect())
    }

    /// Confirmations of `txid`; zero while unknown or in the mempool
    async fn confirmations(&self, txid: &Txid) -> Result<u32, ConnectorError> {
        let status = match self.client.get_tx_status(txid).await {
            Ok(status) => status,
            Err(e) if not_found(&e) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        match (status.confirmed, status.block_height) {
            (true, Some(height)) => {
                let tip = self.client.get_height().await?;
                Ok(tip.saturating_sub(height) + 1)
            }
            _ => Ok(0),
        }
    }
}

/// Outputs paying `script_pubkey` that no transaction in `history` spends
fn unspent(history: &[Transaction], script_pubkey: &bitcoin::Script) -> Vec<Utxo> {
    let spent: HashSet<OutPoint> = history
        .iter()
        .flat_map(|tx| tx.input.iter().map(|input| input.previous_output))
        .collect();

    history
        .iter()
        .rev()
        .flat_map(|tx| {
            let txid = tx.compute_txid();
            tx.output
                .iter()
                .enumerate()
                .filter(|(_, out)| out.script_pubkey.as_script() == script_pubkey)
                .map(move |(vout, out)| Utxo {
                    outpoint: OutPoint::new(txid, vout as u32),
                    value: out.value,
                    script_pubkey: out.script_pubkey.clone(),
                })
        })
        .filter(|utxo| !spent.contains(&utxo.outpoint))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, PubkeyHash, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    fn tx(inputs: Vec<OutPoint>, outputs: Vec<(ScriptBuf, u64)>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: outputs
                .into_iter()
                .map(|(script_pubkey, sats)| TxOut {
                    value: Amount::from_sat(sats),
                    script_pubkey,
                })
                .collect(),
        }
    }

    #[test]
    fn test_unspent_skips_spent_and_foreign_outputs() {
        let mine = ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([1; 20]));
        let theirs = ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([2; 20]));

        let funding = tx(
            vec![OutPoint::null()],
            vec![(mine.clone(), 50_000), (theirs.clone(), 10_000), (mine.clone(), 7_000)],
        );
        let spend = tx(
            vec![OutPoint::new(funding.compute_txid(), 0)],
            vec![(theirs, 30_000), (mine.clone(), 19_000)],
        );
        // newest first, as the explorer lists them
        let history = vec![spend.clone(), funding.clone()];

        let utxos = unspent(&history, &mine);
        let outpoints: Vec<OutPoint> = utxos.iter().map(|u| u.outpoint).collect();
        assert_eq!(
            outpoints,
            vec![
                OutPoint::new(funding.compute_txid(), 2),
                OutPoint::new(spend.compute_txid(), 1),
            ]
        );
        assert_eq!(utxos[0].value, Amount::from_sat(7_000));
        assert!(utxos.iter().all(|u| u.script_pubkey == mine));
    }

    #[test]
    fn test_error_mapping() {
        let rejected = ConnectorError::from(esplora_client::Error::HttpResponse {
            status: 400,
            message: "bad-txns-inputs-missingorspent".to_string(),
        });
        assert!(matches!(rejected, ConnectorError::Rejected(_)));

        let unavailable = esplora_client::Error::HttpResponse {
            status: 503,
            message: "busy".to_string(),
        };
        assert!(!not_found(&unavailable));
        assert!(ConnectorError::from(unavailable).is_retryable());

        assert!(not_found(&esplora_client::Error::HttpResponse {
            status: 404,
            message: "Transaction not found".to_string(),
        }));
    }

    #[test]
    fn test_new_client() {
        let client = EsploraClient::new("BTC", "http://127.0.0.1:3002/").unwrap();
        assert_eq!(client.chain, "BTC");
    }
}
