//! Bounded pool of RPC clients with checkout/release discipline.
//!
//! A sync job checks one client out for the whole run of a contract and
//! hands it back when done. Callers wait when every client is busy.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use tokio::sync::Notify;

use crate::error::RpcError;

struct PoolInner<C> {
    idle: Mutex<Vec<C>>,
    notify: Notify,
    capacity: usize,
    poll_interval: Duration,
}

impl<C> PoolInner<C> {
    fn idle(&self) -> MutexGuard<'_, Vec<C>> {
        // A poisoned free list is still a valid free list.
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, client: C) {
        self.idle().push(client);
        self.notify.notify_one();
    }
}

/// Fixed-capacity client pool.
pub struct RpcPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for RpcPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> RpcPool<C> {
    pub fn new(clients: Vec<C>, poll_interval: Duration) -> Result<Self, RpcError> {
        if clients.is_empty() {
            return Err(RpcError::Fatal("RPC pool needs at least one client".to_string()));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                capacity: clients.len(),
                idle: Mutex::new(clients),
                notify: Notify::new(),
                poll_interval,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.idle().len()
    }

    pub fn try_acquire(&self) -> Option<PooledClient<C>> {
        let client = self.inner.idle().pop()?;
        Some(PooledClient {
            client: Some(client),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Waits until a client is free.
    ///
    /// Woken by releases; also re-polls every `poll_interval`.
    pub async fn acquire(&self) -> PooledClient<C> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(client) = self.try_acquire() {
                return client;
            }
            debug!("RPC pool exhausted ({} clients), waiting", self.capacity());
            let _ = tokio::time::timeout(self.inner.poll_interval, notified).await;
        }
    }
}

/// A checked-out client; returns to the pool on drop.
pub struct PooledClient<C> {
    client: Option<C>,
    pool: Arc<PoolInner<C>>,
}

impl<C> PooledClient<C> {
    /// Returns the client to the pool now.
    pub fn release(self) {}
}

impl<C> Deref for PooledClient<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.client {
            Some(client) => client,
            // Only `Drop` takes the client out.
            None => unreachable!("pooled client used after release"),
        }
    }
}

impl<C> Drop for PooledClient<C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(RpcPool::<u32>::new(vec![], Duration::from_millis(10)).is_err());
    }

    #[tokio::test]
    async fn test_checkout_and_release() {
        let pool = RpcPool::new(vec![1u32, 2], Duration::from_millis(10)).unwrap();
        let a = pool.acquire().await;
        let b = pool.acquire().await;
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().is_none());
        assert_eq!(*a + *b, 3);

        a.release();
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_waiter_is_woken_by_release() {
        let pool = RpcPool::new(vec![7u32], Duration::from_secs(60)).unwrap();
        let held = pool.acquire().await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { *pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let value = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_capacity() {
        let pool = RpcPool::new(vec![(); 3], Duration::from_millis(5)).unwrap();
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                let _client = pool.acquire().await;
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.available(), 3);
    }
}
