//! In-memory swap store for tests and database-less runs

use super::{StoreError, SwapStatus, SwapStore};
use crate::script::{Secret, SecretHash};
use crate::OrderId;

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Default)]
struct SwapRecord {
    status: SwapStatus,
    initiate_details: Option<(i64, SecretHash)>,
    secret: Option<Secret>,
    atom_details: Option<Vec<u8>>,
    foreign_details: Option<Vec<u8>>,
    redeemable: bool,
}

/// Swap store backed by a concurrent map; lost on restart
#[derive(Default)]
pub struct MemorySwapStore {
    records: DashMap<OrderId, SwapRecord>,
}

impl MemorySwapStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `apply` to the order's record, creating it if missing
    fn update(&self, order_id: &OrderId, apply: impl FnOnce(&mut SwapRecord)) {
        apply(&mut self.records.entry(*order_id).or_default());
    }

    /// Read one field, `Missing` when the record or field is absent
    fn read<T>(
        &self,
        order_id: &OrderId,
        field: &'static str,
        get: impl FnOnce(&SwapRecord) -> Option<T>,
    ) -> Result<T, StoreError> {
        self.records
            .get(order_id)
            .and_then(|record| get(&record))
            .ok_or_else(|| StoreError::missing(order_id, field))
    }
}

#[async_trait]
impl SwapStore for MemorySwapStore {
    /// Get the order's status
    async fn status(&self, order_id: &OrderId) -> Result<SwapStatus, StoreError> {
        Ok(self
            .records
            .get(order_id)
            .map(|record| record.status)
            .unwrap_or_default())
    }

    /// Update the order's status
    async fn put_status(&self, order_id: &OrderId, status: SwapStatus) -> Result<(), StoreError> {
        self.update(order_id, |record| record.status = status);
        Ok(())
    }

    async fn put_initiate_details(
        &self,
        order_id: &OrderId,
        expiry: i64,
        secret_hash: SecretHash,
    ) -> Result<(), StoreError> {
        self.update(order_id, |record| {
            record.initiate_details = Some((expiry, secret_hash))
        });
        Ok(())
    }

    async fn initiate_details(&self, order_id: &OrderId) -> Result<(i64, SecretHash), StoreError> {
        self.read(order_id, "initiate details", |record| record.initiate_details)
    }

    async fn put_redeem_details(&self, order_id: &OrderId, secret: &Secret) -> Result<(), StoreError> {
        self.update(order_id, |record| record.secret = Some(secret.clone()));
        Ok(())
    }

    async fn redeem_details(&self, order_id: &OrderId) -> Result<Secret, StoreError> {
        self.read(order_id, "redeem details", |record| record.secret.clone())
    }

    async fn put_atom_details(&self, order_id: &OrderId, details: &[u8]) -> Result<(), StoreError> {
        self.update(order_id, |record| record.atom_details = Some(details.to_vec()));
        Ok(())
    }

    async fn atom_details(&self, order_id: &OrderId) -> Result<Vec<u8>, StoreError> {
        self.read(order_id, "atom details", |record| record.atom_details.clone())
    }

    async fn put_foreign_details(
        &self,
        order_id: &OrderId,
        details: &[u8],
    ) -> Result<(), StoreError> {
        self.update(order_id, |record| record.foreign_details = Some(details.to_vec()));
        Ok(())
    }

    async fn foreign_details(&self, order_id: &OrderId) -> Result<Vec<u8>, StoreError> {
        self.read(order_id, "foreign details", |record| record.foreign_details.clone())
    }

    async fn put_redeemable(&self, order_id: &OrderId) -> Result<(), StoreError> {
        self.update(order_id, |record| record.redeemable = true);
        Ok(())
    }

    async fn redeemed(&self, order_id: &OrderId) -> Result<(), StoreError> {
        self.update(order_id, |record| record.redeemable = false);
        Ok(())
    }

    /// Orders due for the redeem sweep, in no particular order
    async fn redeemable_orders(&self) -> Result<Vec<OrderId>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.redeemable)
            .map(|entry| *entry.key())
            .collect())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_defaults_for_unknown_order() {
        let store = MemorySwapStore::new();
        let id = [1u8; 32];

        assert_eq!(store.status(&id).await.unwrap(), SwapStatus::InfoSubmitted);
        assert!(matches!(
            store.initiate_details(&id).await,
            Err(StoreError::Missing { field: "initiate details", .. })
        ));
        assert!(store.redeem_details(&id).await.is_err());
        assert!(store.atom_details(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_fields_are_independent() {
        let store = MemorySwapStore::new();
        let id = [2u8; 32];
        let secret = Secret::from_bytes([3; 32]);

        store.put_initiate_details(&id, 42, secret.hash()).await.unwrap();
        store.put_status(&id, SwapStatus::InitiateDetailsAcquired).await.unwrap();
        store.put_redeem_details(&id, &secret).await.unwrap();
        store.put_atom_details(&id, b"own").await.unwrap();
        store.put_foreign_details(&id, b"theirs").await.unwrap();
        store.put_status(&id, SwapStatus::Initiated).await.unwrap();

        assert_eq!(store.status(&id).await.unwrap(), SwapStatus::Initiated);
        assert_eq!(store.initiate_details(&id).await.unwrap(), (42, secret.hash()));
        assert_eq!(store.redeem_details(&id).await.unwrap(), secret);
        assert_eq!(store.atom_details(&id).await.unwrap(), b"own");
        assert_eq!(store.foreign_details(&id).await.unwrap(), b"theirs");
    }

    #[tokio::test]
    async fn test_redeemable_sweep_list() {
        let store = MemorySwapStore::new();
        store.put_redeemable(&[1; 32]).await.unwrap();
        store.put_redeemable(&[2; 32]).await.unwrap();
        store.redeemed(&[1; 32]).await.unwrap();

        assert_eq!(store.redeemable_orders().await.unwrap(), vec![[2u8; 32]]);
    }

    #[tokio::test]
    async fn test_concurrent_orders() {
        let store = Arc::new(MemorySwapStore::new());
        let handles: Vec<_> = (0u8..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.put_status(&[i; 32], SwapStatus::Audited).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0u8..16 {
            assert_eq!(store.status(&[i; 32]).await.unwrap(), SwapStatus::Audited);
        }
    }
}
