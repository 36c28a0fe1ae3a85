//! TCP socket setup shared by publisher and subscriber.
//!
//! - Publisher: parse the listen address, open a reusable socket, bind, listen
//! - Subscriber: resolve a host name, preferring a loopback endpoint
//!
//! # Example
//!
//! ```ignore
//! use tcp_pubsub::transport::{bind_listener, resolve_preferring_loopback};
//!
//! let listener = bind_listener("127.0.0.1", 0, 1024)?;
//! let endpoint = resolve_preferring_loopback("localhost", 1588).await?;
//! ```

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};

use crate::error::{PubSubError, Result};

/// Open a listening socket on `address:port`.
///
/// `address` must be an IP literal (`"0.0.0.0"`, `"127.0.0.1"`, `"::"`).
/// Port 0 binds an ephemeral port; read it back from `local_addr()`.
/// Must be called from within a tokio runtime context.
pub fn bind_listener(address: &str, port: u16, backlog: u32) -> Result<TcpListener> {
    let ip: IpAddr = address.parse().map_err(|source| PubSubError::AddressParse {
        address: address.to_string(),
        source,
    })?;
    let addr = SocketAddr::new(ip, port);
    let bind_error = |source: io::Error| PubSubError::Bind {
        endpoint: addr.to_string(),
        source,
    };

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;

    socket.listen(backlog).map_err(|source| PubSubError::Listen {
        endpoint: addr.to_string(),
        source,
    })
}

/// Resolve `address:port` and pick one endpoint.
///
/// A loopback endpoint wins if the name resolves to one, otherwise the first
/// result is used.
pub async fn resolve_preferring_loopback(address: &str, port: u16) -> Result<SocketAddr> {
    let target = format!("{}:{}", address, port);
    let endpoints: Vec<SocketAddr> = lookup_host((address, port))
        .await
        .map_err(|source| PubSubError::Resolve {
            target: target.clone(),
            source,
        })?
        .collect();

    pick_endpoint(&endpoints).ok_or_else(|| PubSubError::Resolve {
        target,
        source: io::Error::new(io::ErrorKind::NotFound, "no endpoints found"),
    })
}

fn pick_endpoint(endpoints: &[SocketAddr]) -> Option<SocketAddr> {
    endpoints
        .iter()
        .find(|endpoint| endpoint.ip().is_loopback())
        .or_else(|| endpoints.first())
        .copied()
}

/// Connect to a resolved endpoint.
pub async fn connect(endpoint: SocketAddr) -> Result<TcpStream> {
    TcpStream::connect(endpoint)
        .await
        .map_err(|source| PubSubError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })
}

/// Disable Nagle's algorithm; failures are only logged.
pub fn set_nodelay(stream: &TcpStream, owner: &str) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("{}: Failed setting tcp::no_delay option: {}", owner, e);
    }
}

/// `local->remote` description of a connected stream, for log messages.
pub fn describe_connection(stream: &TcpStream) -> String {
    let local = stream
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "?".to_string());
    let remote = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "?".to_string());
    format!("{}->{}", local, remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind_listener("127.0.0.1", 0, 16).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let err = bind_listener("not-an-ip", 0, 16).unwrap_err();
        assert!(matches!(err, PubSubError::AddressParse { .. }));
        assert!(err.to_string().contains("not-an-ip"));
    }

    #[tokio::test]
    async fn test_bind_port_in_use() {
        let first = bind_listener("127.0.0.1", 0, 16).unwrap();
        let port = first.local_addr().unwrap().port();

        let err = bind_listener("127.0.0.1", port, 16).unwrap_err();
        assert!(matches!(err, PubSubError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_resolve_localhost_prefers_loopback() {
        let endpoint = resolve_preferring_loopback("localhost", 1588).await.unwrap();
        assert!(endpoint.ip().is_loopback());
        assert_eq!(endpoint.port(), 1588);
    }

    #[test]
    fn test_pick_endpoint() {
        let external: SocketAddr = "192.0.2.1:80".parse().unwrap();
        let loopback: SocketAddr = "127.0.0.1:80".parse().unwrap();

        assert_eq!(pick_endpoint(&[external, loopback]), Some(loopback));
        assert_eq!(pick_endpoint(&[external]), Some(external));
        assert_eq!(pick_endpoint(&[]), None);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let listener = bind_listener("127.0.0.1", 0, 16).unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint: SocketAddr = ([127, 0, 0, 1], port).into();

        let err = connect(endpoint).await.unwrap_err();
        assert!(matches!(err, PubSubError::Connect { .. }));
    }
}
