//! The peer connection abstraction (C3): a single TCP stream to one peer,
//! optionally upgraded to the authenticated-encrypted overlay, leased
//! exclusively to one caller at a time by the connection pool.

pub mod connection_pool;
mod tcp_transport;

use crate::config::SyncNodeConfig;
use crate::crypto::keys::ZeroizingKey;
use crate::error::Result;
use crate::handshake;
use crate::peer::Peer;
use crate::session::EncryptedOverlay;
use crate::wire;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

pub use tcp_transport::{configure_socket, connect_with_timeout};

enum ConnectionStream {
    Plain(TcpStream),
    Encrypted(EncryptedOverlay<TcpStream>),
}

/// One TCP connection to one peer, plain or encrypted, leased exclusively by
/// the pool to one caller at a time.
pub struct PeerConnection {
    pub peer: Peer,
    stream: Option<ConnectionStream>,
    pub last_activity: Instant,
    /// -1 means RTT has not been measured yet.
    pub rtt_ms: i32,
    /// Set once the handshake completes successfully. Per the source
    /// contract a handshake failure does not by itself make the connection
    /// unusable — callers that need confidentiality must check this flag
    /// before relying on it (see DESIGN.md).
    pub handshake_ok: bool,
}

impl PeerConnection {
    /// Opens a TCP connection to `peer` and configures its socket options.
    /// The connection starts in plaintext; call [`Self::run_client_handshake`]
    /// to authenticate and upgrade it.
    pub async fn connect(peer: Peer, config: &SyncNodeConfig) -> Result<Self> {
        let addr = peer.addr_key();
        let stream = connect_with_timeout(&addr, config).await?;
        configure_socket(&stream, config);
        Ok(Self {
            peer,
            stream: Some(ConnectionStream::Plain(stream)),
            last_activity: Instant::now(),
            rtt_ms: -1,
            handshake_ok: false,
        })
    }

    /// Runs the client side of the secure handshake and, on success,
    /// upgrades the connection to the encrypted overlay.
    pub async fn run_client_handshake(
        &mut self,
        local_peer_id: &str,
        local_device_name: &str,
        local_identity: &crate::crypto::IdentityKeyPair,
    ) -> Result<()> {
        let session_key = {
            let Some(ConnectionStream::Plain(stream)) = &mut self.stream else {
                return Ok(());
            };
            handshake::initiate(stream, local_peer_id, local_device_name, local_identity).await?
        };
        self.upgrade_to_encrypted(session_key, true);
        Ok(())
    }

    fn upgrade_to_encrypted(&mut self, session_key: ZeroizingKey, is_client: bool) {
        self.stream = match self.stream.take() {
            Some(ConnectionStream::Plain(stream)) => Some(ConnectionStream::Encrypted(
                EncryptedOverlay::new(stream, &session_key, is_client),
            )),
            already => already,
        };
        self.handshake_ok = true;
    }

    /// Writes one logical message, framed either as a plain length-prefixed
    /// byte array or as an encrypted-overlay frame, depending on whether the
    /// handshake has completed.
    pub async fn write_message(&mut self, data: &[u8]) -> Result<()> {
        self.last_activity = Instant::now();
        match self.stream.as_mut().expect("connection already disposed") {
            ConnectionStream::Plain(stream) => wire::write_length_prefixed(stream, data).await,
            ConnectionStream::Encrypted(overlay) => overlay.write_frame(data).await,
        }
    }

    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        self.last_activity = Instant::now();
        match self.stream.as_mut().expect("connection already disposed") {
            ConnectionStream::Plain(stream) => wire::read_length_prefixed(stream).await,
            ConnectionStream::Encrypted(overlay) => overlay.read_frame().await,
        }
    }

    /// Healthy iff the socket reports connected and a non-blocking
    /// readability peek reports either no data available (socket idle, still
    /// open) or at least one byte available. A readable socket with zero
    /// bytes available means the peer closed the connection. Connections
    /// already upgraded to the encrypted overlay are assumed healthy; the
    /// overlay surfaces broken-pipe errors directly to read/write callers.
    pub async fn is_healthy(&self) -> bool {
        let stream = match self.stream.as_ref() {
            Some(ConnectionStream::Plain(stream)) => stream,
            Some(ConnectionStream::Encrypted(_)) => return true,
            None => return false,
        };
        let mut probe = [0u8; 1];
        match tokio::time::timeout(Duration::ZERO, stream.peek(&mut probe)).await {
            Err(_) => true,      // would block: no data ready, socket open
            Ok(Ok(0)) => false,  // readable with zero bytes: remote closed
            Ok(Ok(_)) => true,   // readable with data: still open
            Ok(Err(_)) => false, // any probe error: treat as unhealthy
        }
    }

    /// Maps the measured RTT to a buffer size class per `config`.
    pub fn optimal_buffer_size(&self, config: &SyncNodeConfig) -> usize {
        if self.rtt_ms < 0 {
            config.default_buffer_size
        } else if self.rtt_ms < config.fast_lan_rtt_ms {
            config.max_buffer_size
        } else if self.rtt_ms > config.slow_link_rtt_ms {
            config.min_buffer_size
        } else {
            config.default_buffer_size
        }
    }

    pub async fn dispose(mut self) {
        let stream = match self.stream.take() {
            Some(ConnectionStream::Plain(stream)) => stream,
            _ => return,
        };
        if let Ok(std_stream) = stream.into_std() {
            let _ = std_stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;
    use tokio::net::TcpListener;

    fn test_peer(addr: std::net::SocketAddr) -> Peer {
        Peer {
            id: "peer-under-test".into(),
            name: "test device".into(),
            ip: addr.ip().to_string(),
            port: addr.port(),
            identity_public_key: [0u8; 32],
        }
    }

    #[tokio::test]
    async fn freshly_connected_socket_is_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let config = SyncNodeConfig::default();
        let conn = PeerConnection::connect(test_peer(addr), &config).await.unwrap();
        assert!(conn.is_healthy().await);
    }

    #[tokio::test]
    async fn closed_peer_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let config = SyncNodeConfig::default();
        let conn = PeerConnection::connect(test_peer(addr), &config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.is_healthy().await);
    }

    #[tokio::test]
    async fn unmeasured_rtt_uses_default_buffer_size() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let config = SyncNodeConfig::default();
        let conn = PeerConnection::connect(test_peer(addr), &config).await.unwrap();
        assert_eq!(conn.optimal_buffer_size(&config), config.default_buffer_size);
    }

    #[tokio::test]
    async fn full_handshake_upgrades_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            handshake::accept(&mut socket, &std::collections::HashMap::new())
                .await
                .unwrap()
        });

        let config = SyncNodeConfig::default();
        let client_identity = IdentityKeyPair::generate();
        let mut conn = PeerConnection::connect(test_peer(addr), &config).await.unwrap();
        conn.run_client_handshake("client-1", "laptop", &client_identity)
            .await
            .unwrap();

        let outcome = server_task.await.unwrap();
        assert_eq!(outcome.peer_id, "client-1");
        assert!(conn.handshake_ok);
    }
}
