//! In-flight order tracking

use crate::OrderId;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Orders currently being processed by this process. Never persisted.
#[derive(Debug, Default)]
pub struct MutexCache {
    in_flight: Mutex<HashSet<OrderId>>,
}

impl MutexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic test-and-set; `false` when the order is already locked
    pub fn lock(&self, order_id: &OrderId) -> bool {
        self.in_flight.lock().insert(*order_id)
    }

    pub fn unlock(&self, order_id: &OrderId) {
        self.in_flight.lock().remove(order_id);
    }

    pub fn is_locked(&self, order_id: &OrderId) -> bool {
        self.in_flight.lock().contains(order_id)
    }

    /// Lock `order_id` until the returned guard drops
    pub fn try_acquire(self: &Arc<Self>, order_id: OrderId) -> Option<CacheGuard> {
        self.lock(&order_id).then(|| CacheGuard {
            cache: self.clone(),
            order_id,
        })
    }
}

pub struct CacheGuard {
    cache: Arc<MutexCache>,
    order_id: OrderId,
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        self.cache.unlock(&self.order_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock() {
        let cache = MutexCache::new();
        let id = [1u8; 32];

        assert!(cache.lock(&id));
        assert!(!cache.lock(&id));
        assert!(cache.lock(&[2u8; 32]));

        cache.unlock(&id);
        assert!(!cache.is_locked(&id));
        assert!(cache.lock(&id));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let cache = Arc::new(MutexCache::new());
        let id = [3u8; 32];

        let guard = cache.try_acquire(id).unwrap();
        assert!(cache.try_acquire(id).is_none());
        drop(guard);
        assert!(cache.try_acquire(id).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_lock_has_one_winner() {
        let cache = Arc::new(MutexCache::new());
        let id = [4u8; 32];

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.lock(&id) })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
