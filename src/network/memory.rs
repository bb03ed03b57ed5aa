//! In-process signalling channel shared by both parties of a local swap

use super::{NetworkError, SwapNetwork};
use crate::clock::Clock;
use crate::OrderId;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub struct MemoryNetwork {
    addresses: DashMap<OrderId, String>,
    details: DashMap<OrderId, Vec<u8>>,
    published: Notify,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl MemoryNetwork {
    pub fn new(clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        Self {
            addresses: DashMap::new(),
            details: DashMap::new(),
            published: Notify::new(),
            clock,
            poll_interval,
        }
    }

    async fn wait<T: Clone>(
        &self,
        map: &DashMap<OrderId, T>,
        order_id: OrderId,
        deadline: i64,
        what: &'static str,
    ) -> Result<T, NetworkError> {
        loop {
            let notified = self.published.notified();
            if let Some(value) = map.get(&order_id) {
                return Ok(value.clone());
            }
            if self.clock.now() >= deadline {
                return Err(NetworkError::deadline(&order_id, what));
            }
            // The clock may be moved externally, so wake up periodically too
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[async_trait]
impl SwapNetwork for MemoryNetwork {
    async fn send_owner_address(&self, order_id: OrderId, address: String) -> Result<(), NetworkError> {
        self.addresses.insert(order_id, address);
        self.published.notify_waiters();
        Ok(())
    }

    async fn receive_owner_address(&self, order_id: OrderId, deadline: i64) -> Result<String, NetworkError> {
        self.wait(&self.addresses, order_id, deadline, "owner address").await
    }

    async fn send_swap_details(&self, order_id: OrderId, details: Vec<u8>) -> Result<(), NetworkError> {
        self.details.insert(order_id, details);
        self.published.notify_waiters();
        Ok(())
    }

    async fn receive_swap_details(&self, order_id: OrderId, deadline: i64) -> Result<Vec<u8>, NetworkError> {
        self.wait(&self.details, order_id, deadline, "swap details").await
    }
}
