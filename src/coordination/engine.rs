//! Orchestrator running one task per in-flight swap

use super::cache::MutexCache;
use crate::atom::AtomFactory;
use crate::error::{SwapperError, SwapperResult};
use crate::order_tag;
use crate::state::{SwapStatus, SwapStore};
use crate::swap::{Request, Swap, SwapContext, SwapError};
use crate::OrderId;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Final result of one swap task
#[derive(Debug, Clone)]
pub struct SwapOutcome {
    pub order_id: OrderId,
    pub result: Result<SwapStatus, String>,
}

pub struct SwapEngine<F: AtomFactory> {
    factory: Arc<F>,
    ctx: SwapContext,
    cache: Arc<MutexCache>,
    queue_tx: mpsc::Sender<Request>,
    queue_rx: Mutex<Option<mpsc::Receiver<Request>>>,
    outcomes: mpsc::UnboundedSender<SwapOutcome>,
    shutdown: watch::Sender<bool>,
}

impl<F: AtomFactory + 'static> SwapEngine<F> {
    pub fn new(
        factory: Arc<F>,
        ctx: SwapContext,
        buffer: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SwapOutcome>) {
        let (queue_tx, queue_rx) = mpsc::channel(buffer.max(1));
        let (outcomes, outcome_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let engine = Arc::new(Self {
            factory,
            ctx,
            cache: Arc::new(MutexCache::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            outcomes,
            shutdown,
        });
        (engine, outcome_rx)
    }

    pub fn store(&self) -> &Arc<dyn SwapStore> {
        &self.ctx.store
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    pub fn is_in_flight(&self, order_id: &OrderId) -> bool {
        self.cache.is_locked(order_id)
    }

    /// Hand a matched order to the run loop
    pub async fn queue(&self, request: Request) -> SwapperResult<()> {
        self.queue_tx
            .send(request)
            .await
            .map_err(|_| SwapperError::EngineStopped)
    }

    /// Start a swap task unless the order is already in flight.
    /// Returns whether a task was started.
    pub fn submit(self: &Arc<Self>, request: Request) -> bool {
        let Some(guard) = self.cache.try_acquire(request.id) else {
            debug!("[{}] Already in flight, ignoring", order_tag(&request.id));
            return false;
        };

        info!(
            "[{}] Starting swap {} -> {}",
            order_tag(&request.id),
            request.send_currency,
            request.receive_currency
        );
        crate::metrics::record_swap_started(&request.send_currency, &request.receive_currency);

        let engine = self.clone();
        tokio::spawn(async move {
            let order_id = request.id;
            let tag = order_tag(&order_id);
            let result = engine.execute(request).await;

            let outcome = match &result {
                Ok(status) => {
                    info!("[{}] Swap finished: {}", tag, status);
                    "redeemed"
                }
                Err(SwapperError::Swap(SwapError::Complained { .. })) => {
                    warn!("[{}] Swap ended with a complaint", tag);
                    "complained"
                }
                Err(e) => {
                    error!("[{}] Swap failed: {}", tag, e);
                    "failed"
                }
            };
            crate::metrics::record_swap_finished(outcome);
            drop(guard);

            let outcome = SwapOutcome {
                order_id,
                result: result.map_err(|e| e.to_string()),
            };
            if engine.outcomes.send(outcome).is_err() {
                debug!("[{}] Outcome receiver closed", tag);
            }
        });
        true
    }

    async fn execute(&self, request: Request) -> SwapperResult<SwapStatus> {
        let personal = self.factory.build_atom(&request.send_currency, &request.id)?;
        let foreign = self
            .factory
            .build_atom(&request.receive_currency, &request.foreign_id)?;
        let swap = Swap::new(request, personal, foreign, self.ctx.clone())?;
        Ok(swap.execute().await?)
    }

    /// Reclaim this side's locked funds after expiry
    pub async fn refund(&self, request: Request) -> SwapperResult<()> {
        let tag = order_tag(&request.id);
        let _guard = self
            .cache
            .try_acquire(request.id)
            .ok_or_else(|| SwapperError::InFlight(tag.clone()))?;

        let personal = self.factory.build_atom(&request.send_currency, &request.id)?;
        let foreign = self
            .factory
            .build_atom(&request.receive_currency, &request.foreign_id)?;
        Swap::new(request, personal, foreign, self.ctx.clone())?
            .refund()
            .await?;

        info!("[{}] Refunded", tag);
        Ok(())
    }

    /// Consume queued requests until stopped
    pub async fn run(self: Arc<Self>) -> SwapperResult<()> {
        let mut queue = self
            .queue_rx
            .lock()
            .take()
            .ok_or_else(|| SwapperError::Internal("engine is already running".to_string()))?;
        let mut shutdown = self.shutdown.subscribe();

        match self.ctx.store.redeemable_orders().await {
            Ok(orders) if !orders.is_empty() => warn!(
                "{} orders hold initiated contracts and are not redeemed; resubmit them to resume",
                orders.len()
            ),
            Ok(_) => {}
            Err(e) => warn!("Could not list unfinished orders: {}", e),
        }

        info!("Swap engine started");

        while !*shutdown.borrow() {
            tokio::select! {
                request = queue.recv() => match request {
                    Some(request) => {
                        self.submit(request);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Swap engine stopped");
        Ok(())
    }

    /// Stop accepting requests. Running swaps continue.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        info!("Swap engine shutdown initiated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::sim::{SimAccountChain, SimUtxoChain};
    use crate::atom::{ChainBinding, ChainRegistry};
    use crate::clock::ManualClock;
    use crate::config::{AccountChainConfig, UtxoChainConfig};
    use crate::network::MemoryNetwork;
    use crate::state::MemorySwapStore;
    use crate::swap::{RetryPolicy, Timing};
    use crate::watchdog::MockWatchdog;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::{Address as UtxoAddress, Network, PrivateKey};
    use ethers::types::{Address, U256};
    use std::time::Duration;
    use tokio_test::assert_ok;

    const NOW: i64 = 1_700_000_000;
    const VALUE: u64 = 3_000_000;

    fn utxo_config(priority_code: u32) -> UtxoChainConfig {
        UtxoChainConfig {
            priority_code,
            network: Network::Regtest,
            api_url: String::new(),
            fee_sats: 10_000,
            min_confirmations: 1,
            poll_interval_ms: 1,
            private_key_env: String::new(),
        }
    }

    fn account_config(priority_code: u32) -> AccountChainConfig {
        AccountChainConfig {
            priority_code,
            chain_id: 1337,
            rpc_urls: vec![],
            contract_address: String::new(),
            gas_limit: 3_000_000,
            gas_price_gwei: None,
            instant_receipts: true,
            poll_interval_ms: 1,
            private_key_env: String::new(),
        }
    }

    fn utxo_key(seed: u8) -> PrivateKey {
        PrivateKey::new(SecretKey::from_slice(&[seed; 32]).unwrap(), Network::Regtest)
    }

    fn utxo_address(key: &PrivateKey) -> UtxoAddress {
        UtxoAddress::p2pkh(key.public_key(&Secp256k1::new()), Network::Regtest)
    }

    /// Both parties' chains, signalling and clock
    struct World {
        clock: Arc<ManualClock>,
        network: Arc<MemoryNetwork>,
        utxo: Arc<SimUtxoChain>,
        account: Arc<SimAccountChain>,
        contract: Address,
        btc_priority: u32,
    }

    struct Party {
        engine: Arc<SwapEngine<ChainRegistry>>,
        outcomes: mpsc::UnboundedReceiver<SwapOutcome>,
        store: Arc<MemorySwapStore>,
    }

    impl World {
        fn new(btc_priority: u32) -> Self {
            let clock = Arc::new(ManualClock::new(NOW));
            let contract = Address::repeat_byte(0xcc);
            Self {
                network: Arc::new(MemoryNetwork::new(clock.clone(), Duration::from_millis(1))),
                utxo: SimUtxoChain::new(clock.clone()),
                account: SimAccountChain::new(contract, clock.clone()),
                contract,
                clock,
                btc_priority,
            }
        }

        fn party(&self, utxo_seed: u8, wallet: Address) -> Party {
            let registry = ChainRegistry::new(self.clock.clone())
                .with_chain(
                    "BTC",
                    ChainBinding::Utxo {
                        config: utxo_config(self.btc_priority),
                        connector: self.utxo.clone(),
                        key: utxo_key(utxo_seed),
                    },
                )
                .with_chain(
                    "ETH",
                    ChainBinding::Account {
                        config: account_config(1 - self.btc_priority),
                        contract: self.contract,
                        connector: self.account.connector(wallet),
                    },
                );

            let store = Arc::new(MemorySwapStore::new());
            let ctx = SwapContext {
                store: store.clone(),
                network: self.network.clone(),
                watchdog: Arc::new(MockWatchdog::new()),
                clock: self.clock.clone(),
                retry: RetryPolicy::new(Duration::from_millis(2), Some(500)),
                timing: Timing::default(),
            };
            let (engine, outcomes) = SwapEngine::new(Arc::new(registry), ctx, 8);
            Party {
                engine,
                outcomes,
                store,
            }
        }
    }

    const ALICE_WALLET: u8 = 0xa1;
    const BOB_WALLET: u8 = 0xb0;

    /// Alice sells BTC for ETH, Bob the reverse
    fn requests() -> (Request, Request) {
        let bob_btc = utxo_address(&utxo_key(2)).to_string();
        let alice_eth = format!("{:?}", Address::repeat_byte(ALICE_WALLET));

        let alice = Request {
            id: [1; 32],
            foreign_id: [2; 32],
            send_currency: "BTC".to_string(),
            receive_currency: "ETH".to_string(),
            send_value: U256::from(VALUE),
            receive_value: U256::from(VALUE),
            receive_address: alice_eth,
            secret: None,
            secret_hash: None,
            time_lock: None,
        };
        let bob = Request {
            id: [2; 32],
            foreign_id: [1; 32],
            send_currency: "ETH".to_string(),
            receive_currency: "BTC".to_string(),
            send_value: U256::from(VALUE),
            receive_value: U256::from(VALUE),
            receive_address: bob_btc,
            secret: None,
            secret_hash: None,
            time_lock: None,
        };
        (alice, bob)
    }

    async fn next_outcome(party: &mut Party) -> SwapOutcome {
        tokio::time::timeout(Duration::from_secs(20), party.outcomes.recv())
            .await
            .expect("swap did not finish in time")
            .expect("outcome channel closed")
    }

    async fn swap_end_to_end(btc_priority: u32) {
        let world = World::new(btc_priority);
        world
            .utxo
            .fund(&utxo_address(&utxo_key(1)), 10_000_000);
        world
            .account
            .fund(Address::repeat_byte(BOB_WALLET), U256::from(10_000_000u64));

        let mut alice = world.party(1, Address::repeat_byte(ALICE_WALLET));
        let mut bob = world.party(2, Address::repeat_byte(BOB_WALLET));
        let alice_run = tokio::spawn(alice.engine.clone().run());
        let bob_run = tokio::spawn(bob.engine.clone().run());

        let (alice_request, bob_request) = requests();
        alice.engine.queue(alice_request).await.unwrap();
        bob.engine.queue(bob_request).await.unwrap();

        let alice_outcome = next_outcome(&mut alice).await;
        let bob_outcome = next_outcome(&mut bob).await;
        assert_eq!(alice_outcome.order_id, [1; 32]);
        assert_eq!(alice_outcome.result, Ok(SwapStatus::Redeemed));
        assert_eq!(bob_outcome.order_id, [2; 32]);
        assert_eq!(bob_outcome.result, Ok(SwapStatus::Redeemed));

        assert_eq!(
            alice.store.status(&[1; 32]).await.unwrap(),
            SwapStatus::Redeemed
        );
        assert_eq!(
            bob.store.status(&[2; 32]).await.unwrap(),
            SwapStatus::Redeemed
        );
        assert_eq!(
            world.account.balance_of(Address::repeat_byte(ALICE_WALLET)),
            U256::from(VALUE)
        );
        assert_eq!(
            world.utxo.balance(&utxo_address(&utxo_key(2))),
            VALUE - 10_000
        );
        assert!(!alice.engine.is_in_flight(&[1; 32]));

        alice.engine.stop();
        bob.engine.stop();
        assert_ok!(alice_run.await.unwrap());
        assert_ok!(bob_run.await.unwrap());
    }

    #[tokio::test]
    async fn test_swap_utxo_side_goes_first() {
        swap_end_to_end(0).await;
    }

    #[tokio::test]
    async fn test_swap_account_side_goes_first() {
        swap_end_to_end(1).await;
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_ignored() {
        let world = World::new(0);
        world
            .utxo
            .fund(&utxo_address(&utxo_key(1)), 10_000_000);
        let alice = world.party(1, Address::repeat_byte(ALICE_WALLET));
        let (request, _) = requests();

        // no counterparty: the swap parks waiting for Bob's address
        assert!(alice.engine.submit(request.clone()));
        assert!(!alice.engine.submit(request.clone()));
        assert!(alice.engine.is_in_flight(&request.id));

        assert!(matches!(
            alice.engine.refund(request).await,
            Err(SwapperError::InFlight(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_after_stop_fails() {
        let world = World::new(0);
        let alice = world.party(1, Address::repeat_byte(ALICE_WALLET));

        let run = tokio::spawn(alice.engine.clone().run());
        alice.engine.stop();
        assert_ok!(run.await.unwrap());

        let (request, _) = requests();
        assert!(matches!(
            alice.engine.queue(request).await,
            Err(SwapperError::EngineStopped)
        ));
        assert!(matches!(
            alice.engine.clone().run().await,
            Err(SwapperError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_chain_reports_failure() {
        let world = World::new(0);
        let mut alice = world.party(1, Address::repeat_byte(ALICE_WALLET));
        let (mut request, _) = requests();
        request.receive_currency = "DOGE".to_string();

        assert!(alice.engine.submit(request));
        let outcome = next_outcome(&mut alice).await;
        assert!(outcome.result.unwrap_err().contains("DOGE"));
        assert!(!alice.engine.is_in_flight(&[1; 32]));
    }
}
