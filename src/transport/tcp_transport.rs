//! Raw TCP connection establishment and socket tuning for peer connections.

use crate::config::SyncNodeConfig;
use crate::error::{Error, Result};
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::warn;

/// Opens a TCP connection to `addr`, aborting if it takes longer than
/// `config.connection_timeout_ms`.
pub async fn connect_with_timeout(addr: &str, config: &SyncNodeConfig) -> Result<TcpStream> {
    let timeout = Duration::from_millis(config.connection_timeout_ms);
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(Error::ConnectIo(err)),
        Err(_) => Err(Error::ConnectTimeout {
            addr: addr.to_string(),
            timeout_ms: config.connection_timeout_ms,
        }),
    }
}

/// Applies keep-alive, timeout and Nagle socket options. Each option is
/// best-effort: a failure is logged and never aborts connection setup.
pub fn configure_socket(stream: &TcpStream, config: &SyncNodeConfig) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!(error = %err, "failed to disable Nagle's algorithm");
    }

    let timeout = Duration::from_millis(config.connection_timeout_ms);
    let sock_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new().with_time(timeout);
    if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %err, "failed to configure tcp keepalive");
    }
    if let Err(err) = sock_ref.set_read_timeout(Some(timeout)) {
        warn!(error = %err, "failed to configure read timeout");
    }
    if let Err(err) = sock_ref.set_write_timeout(Some(timeout)) {
        warn!(error = %err, "failed to configure write timeout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_succeeds_against_a_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut config = SyncNodeConfig::default();
        config.connection_timeout_ms = 1000;
        let stream = connect_with_timeout(&addr.to_string(), &config).await.unwrap();
        configure_socket(&stream, &config);
    }

    #[tokio::test]
    async fn connect_fails_fast_against_a_timeout() {
        let mut config = SyncNodeConfig::default();
        config.connection_timeout_ms = 1;
        // 10.255.255.1 is a non-routable address chosen to stall the TCP
        // handshake rather than reject it immediately.
        let result = connect_with_timeout("10.255.255.1:9", &config).await;
        assert!(result.is_err());
    }
}
