use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleetwire_transport::Endpoint;
use tracing::debug;

use super::client::{ClientOptions, MessageClient};
use crate::error::{ChannelError, Result};

/// Fixed set of [`MessageClient`] connections to one endpoint.
///
/// `acquire` hands out the least loaded client; load counts both requests
/// in flight and outstanding leases.
pub struct ConnectionPool {
    endpoint: Endpoint,
    clients: Vec<Arc<MessageClient>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create `size` lazily connecting clients (at least one).
    pub fn open(endpoint: Endpoint, options: ClientOptions, size: usize) -> Self {
        let clients = (0..size.max(1))
            .map(|_| Arc::new(MessageClient::new(endpoint.clone(), options.clone())))
            .collect();
        Self {
            endpoint,
            clients,
            closed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> &[Arc<MessageClient>] {
        &self.clients
    }

    /// Lease the least loaded client.
    pub fn acquire(&self) -> Result<PooledClient> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let client = self
            .clients
            .iter()
            .min_by_key(|client| client.load())
            .ok_or(ChannelError::Closed)?;
        client.lease();
        Ok(PooledClient {
            client: client.clone(),
        })
    }

    /// Close every client, failing their outstanding calls. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for client in &self.clients {
            client.close().await;
        }
        debug!(endpoint = %self.endpoint, size = self.clients.len(), "connection pool shut down");
    }
}

/// A leased pool client; the lease ends on drop or [`PooledClient::release`].
pub struct PooledClient {
    client: Arc<MessageClient>,
}

impl PooledClient {
    pub fn release(self) {}
}

impl Deref for PooledClient {
    type Target = MessageClient;

    fn deref(&self) -> &MessageClient {
        &self.client
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.client.unlease();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize) -> ConnectionPool {
        ConnectionPool::open(
            Endpoint::tcp("127.0.0.1", 1),
            ClientOptions::default(),
            size,
        )
    }

    #[test]
    fn acquire_spreads_leases() {
        let pool = pool(3);
        let leases: Vec<_> = (0..3)
            .map(|_| pool.acquire().expect("acquire should succeed"))
            .collect();
        for client in pool.clients() {
            assert_eq!(client.load(), 1);
        }

        drop(leases);
        for client in pool.clients() {
            assert_eq!(client.load(), 0);
        }
    }

    #[test]
    fn release_returns_the_lease() {
        let pool = pool(2);
        let first = pool.acquire().expect("acquire should succeed");
        let second = pool.acquire().expect("acquire should succeed");
        assert!(!std::ptr::eq(&*first, &*second));

        first.release();
        let third = pool.acquire().expect("acquire should succeed");
        assert_eq!(third.load(), 1);
        assert_eq!(second.load(), 1);
    }

    #[test]
    fn zero_size_still_opens_one_client() {
        assert_eq!(pool(0).size(), 1);
    }

    #[tokio::test]
    async fn acquire_after_shutdown_fails() {
        let pool = pool(2);
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(matches!(pool.acquire(), Err(ChannelError::Closed)));
    }
}
