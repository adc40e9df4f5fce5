//! TCP listener and dialer
//!
//! Accepts incoming peer connections and hands them to the peer table.

use crate::network::endpoint::Endpoint;
use crate::network::peer::NetworkError;
use crate::network::table::PeerTable;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local: Endpoint,
}

impl Server {
    /// Bind to `address:port`; port 0 picks a free port
    pub async fn bind(address: &str, port: u16) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind((address, port)).await?;
        let local = Endpoint::from(listener.local_addr()?);
        log::info!("Server listening on {}", local);

        Ok(Self { listener, local })
    }

    /// Bound endpoint, with the real port
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn port(&self) -> u16 {
        self.local.port()
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }

    /// Accept until `shutdown` fires
    pub async fn run(self, table: Arc<PeerTable>, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    if let Err(reason) = table.register_incoming(stream, addr) {
                        log::debug!("Rejected inbound connection from {}: {}", addr, reason);
                    }
                }
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        log::info!("Server on {} stopped", self.local);
    }
}

/// Connect to a peer, giving up after `timeout`
pub async fn dial(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, NetworkError> {
    let connect = TcpStream::connect((endpoint.address(), endpoint.port()));
    let stream = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(NetworkError::ConnectionFailed(format!("{}: {}", endpoint, e)));
        }
        Err(_) => return Err(NetworkError::Timeout(endpoint.key())),
    };

    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Could not set TCP_NODELAY for {}: {}", endpoint, e);
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_reports_real_port() {
        let server = Server::bind("127.0.0.1", 0).await.unwrap();
        assert_ne!(server.port(), 0);
        assert_eq!(server.local_endpoint().address(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let server = Server::bind("127.0.0.1", 0).await.unwrap();
        let target = server.local_endpoint().clone();

        let (dialed, accepted) = tokio::join!(
            dial(&target, Duration::from_secs(2)),
            server.accept()
        );
        let dialed = dialed.unwrap();
        let (_stream, addr) = accepted.unwrap();
        assert_eq!(dialed.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let server = Server::bind("127.0.0.1", 0).await.unwrap();
        let target = server.local_endpoint().clone();
        drop(server);

        assert!(matches!(
            dial(&target, Duration::from_secs(2)).await,
            Err(NetworkError::ConnectionFailed(_))
        ));
    }
}
