//! One connection pool per peer (C5): lends exclusively-leased
//! [`PeerConnection`]s, creating new TCP connections lazily and bounded by
//! `max_parallel_connections`.

use crate::config::SyncNodeConfig;
use crate::crypto::IdentityKeyPair;
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::transport::PeerConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exclusive lease on a healthy connection, returned by
/// [`ConnectionPool::acquire`] and [`ConnectionPool::get_primary`]. Dropping
/// it releases the per-connection lock.
pub type ConnectionLease = OwnedMutexGuard<PeerConnection>;

struct Slot {
    connection: Arc<Mutex<PeerConnection>>,
}

/// Pool state guarded by an admission mutex distinct from each connection's
/// own per-connection lock. One instance per remote peer.
pub struct ConnectionPool {
    peer: Peer,
    config: SyncNodeConfig,
    local_peer_id: String,
    local_device_name: String,
    local_identity: Arc<IdentityKeyPair>,
    slots: Mutex<Vec<Slot>>,
}

impl ConnectionPool {
    pub fn new(
        peer: Peer,
        config: SyncNodeConfig,
        local_peer_id: String,
        local_device_name: String,
        local_identity: Arc<IdentityKeyPair>,
    ) -> Self {
        Self {
            peer,
            config,
            local_peer_id,
            local_device_name,
            local_identity,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Grants exclusive use of one healthy connection, creating one if the
    /// pool has spare capacity, or waiting (bounded polling) if all existing
    /// connections are leased and the pool is at capacity.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<ConnectionLease> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut slots = self.slots.lock().await;
            self.sweep_unhealthy(&mut slots).await;

            for slot in slots.iter() {
                if let Ok(mut guard) = slot.connection.clone().try_lock_owned() {
                    guard.last_activity = std::time::Instant::now();
                    return Ok(guard);
                }
            }

            if slots.len() < self.config.max_parallel_connections {
                match self.create_connection(cancel).await {
                    Ok(connection) => {
                        let handle = Arc::new(Mutex::new(connection));
                        let guard = handle
                            .clone()
                            .try_lock_owned()
                            .expect("freshly created connection has no other holders");
                        slots.push(Slot { connection: handle });
                        return Ok(guard);
                    }
                    Err(err) => {
                        error!(peer = %self.peer.id, error = %err, "failed to create pooled connection");
                        return Err(err);
                    }
                }
            }

            drop(slots);

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(ACQUIRE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Simplified path used for operations needing a single stable channel:
    /// takes the first healthy connection (blocking on its lock), or creates
    /// one if the pool is empty.
    pub async fn get_primary(&self, cancel: &CancellationToken) -> Result<ConnectionLease> {
        let mut slots = self.slots.lock().await;
        self.sweep_unhealthy(&mut slots).await;

        if let Some(slot) = slots.first() {
            return Ok(slot.connection.clone().lock_owned().await);
        }

        let connection = self.create_connection(cancel).await?;
        let handle = Arc::new(Mutex::new(connection));
        let guard = handle
            .clone()
            .try_lock_owned()
            .expect("freshly created connection has no other holders");
        slots.push(Slot { connection: handle });
        Ok(guard)
    }

    /// Closes all connections and clears pool state. Idempotent.
    pub async fn dispose(&self) {
        let mut slots = self.slots.lock().await;
        for slot in slots.drain(..) {
            if let Ok(connection) = Arc::try_unwrap(slot.connection) {
                connection.into_inner().dispose().await;
            }
        }
    }

    /// Drops slots observed unhealthy. Only inspects connections that aren't
    /// currently leased: a slot whose per-connection lock can't be acquired
    /// immediately is presumed healthy and left alone, since blocking here
    /// while holding the admission mutex would stall every other caller's
    /// `acquire`/`get_primary` behind whatever I/O the lease-holder is doing.
    async fn sweep_unhealthy(&self, slots: &mut Vec<Slot>) {
        let mut keep = Vec::with_capacity(slots.len());
        for slot in slots.drain(..) {
            let healthy = match slot.connection.try_lock() {
                Ok(guard) => guard.is_healthy().await,
                Err(_) => true,
            };
            if healthy {
                keep.push(slot);
            }
        }
        *slots = keep;
    }

    async fn create_connection(&self, cancel: &CancellationToken) -> Result<PeerConnection> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = self.try_create_once() => result,
            };

            match result {
                Ok(connection) => return Ok(connection),
                Err(err) if attempt >= self.config.max_retry_attempts => {
                    error!(peer = %self.peer.id, error = %err, attempt, "exhausted connection retry attempts");
                    return Err(err);
                }
                Err(err) => {
                    warn!(peer = %self.peer.id, error = %err, attempt, "connection attempt failed, retrying");
                    let backoff = self.config.retry_base_delay_ms * 2u64.pow(attempt - 1);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                    }
                }
            }
        }
    }

    async fn try_create_once(&self) -> Result<PeerConnection> {
        let mut connection = PeerConnection::connect(self.peer.clone(), &self.config).await?;

        // A handshake failure is logged but does not abort connection
        // creation; per the source contract the overlay then simply stays
        // plain (see handshake_ok on PeerConnection).
        if let Err(err) = connection
            .run_client_handshake(&self.local_peer_id, &self.local_device_name, &self.local_identity)
            .await
        {
            warn!(peer = %self.peer.id, error = %err, "handshake failed, connection remains plaintext");
        }

        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake;
    use tokio::net::TcpListener;

    fn test_config() -> SyncNodeConfig {
        let mut config = SyncNodeConfig::default();
        config.max_parallel_connections = 2;
        config.connection_timeout_ms = 500;
        config.max_retry_attempts = 1;
        config.retry_base_delay_ms = 5;
        config
    }

    async fn spawn_accepting_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let _ = handshake::accept(&mut socket, &std::collections::HashMap::new()).await;
                    // Keep the socket open so health probes observe it as alive.
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });
        addr
    }

    fn test_pool(addr: std::net::SocketAddr, config: SyncNodeConfig) -> ConnectionPool {
        let peer = Peer {
            id: "peer-1".into(),
            name: "test".into(),
            ip: addr.ip().to_string(),
            port: addr.port(),
            identity_public_key: [0u8; 32],
        };
        ConnectionPool::new(
            peer,
            config,
            "local-id".into(),
            "local-device".into(),
            Arc::new(IdentityKeyPair::generate()),
        )
    }

    #[tokio::test]
    async fn acquire_creates_a_connection_when_empty() {
        let addr = spawn_accepting_server().await;
        let pool = test_pool(addr, test_config());
        let cancel = CancellationToken::new();

        let lease = pool.acquire(&cancel).await.unwrap();
        assert!(lease.handshake_ok);
    }

    #[tokio::test]
    async fn acquire_reuses_a_released_connection_instead_of_growing() {
        let addr = spawn_accepting_server().await;
        let pool = test_pool(addr, test_config());
        let cancel = CancellationToken::new();

        let first = pool.acquire(&cancel).await.unwrap();
        drop(first);

        let _second = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.slots.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn acquire_grows_up_to_max_parallel_connections() {
        let addr = spawn_accepting_server().await;
        let pool = test_pool(addr, test_config());
        let cancel = CancellationToken::new();

        let _first = pool.acquire(&cancel).await.unwrap();
        let _second = pool.acquire(&cancel).await.unwrap();

        assert_eq!(pool.slots.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn get_primary_creates_first_connection_when_empty() {
        let addr = spawn_accepting_server().await;
        let pool = test_pool(addr, test_config());
        let cancel = CancellationToken::new();

        let primary = pool.get_primary(&cancel).await.unwrap();
        assert!(primary.handshake_ok);
    }

    #[tokio::test]
    async fn acquire_fails_with_cancelled_when_at_capacity_and_cancelled() {
        let addr = spawn_accepting_server().await;
        let mut config = test_config();
        config.max_parallel_connections = 1;
        let pool = test_pool(addr, config);
        let cancel = CancellationToken::new();

        let _first = pool.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let result = pool.acquire(&cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
