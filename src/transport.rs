//! Byte-stream channels and how to connect them.
//!
//! A session talks to its peer over anything that is `AsyncRead + AsyncWrite`. The default
//! [`SocketConnector`] dials TCP or Unix domain sockets from a string address.

use std::{fmt, io, path::PathBuf};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, UnixStream},
};
use tracing::trace;

use crate::error::*;

/// A connected, bidirectional byte stream.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Where to reach a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A `host:port` TCP endpoint.
    Tcp(String),
    /// A Unix domain socket path.
    Unix(PathBuf),
}

impl Address {
    /// Parses an address string.
    ///
    /// Accepts `tcp://host:port` and `unix://path`. Without a scheme, anything that looks like a
    /// filesystem path (contains `/` or ends in `.sock`) is a Unix socket and everything else is
    /// taken as `host:port`. A blank address is an [`RpcError::Connect`] with an
    /// `InvalidInput` source.
    pub fn parse(address: &str) -> Result<Self> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(RpcError::Connect {
                address: address.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty address"),
            });
        }
        let address = trimmed;
        if let Some(rest) = address.strip_prefix("tcp://") {
            return Ok(Address::Tcp(rest.to_string()));
        }
        if let Some(rest) = address.strip_prefix("unix://") {
            return Ok(Address::Unix(PathBuf::from(rest)));
        }
        if address.contains('/') || address.ends_with(".sock") {
            Ok(Address::Unix(PathBuf::from(address)))
        } else {
            Ok(Address::Tcp(address.to_string()))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "tcp://{}", addr),
            Address::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Opens channels to peers. Implement this to run a session over another kind of stream.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `address`. Failures should be reported as [`RpcError::Connect`].
    async fn connect(&self, address: &str) -> Result<Box<dyn Channel>>;
}

/// Connects over TCP or Unix domain sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketConnector;

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn Channel>> {
        let parsed = Address::parse(address)?;
        let connect_error = |source| RpcError::Connect {
            address: address.to_string(),
            source,
        };
        match &parsed {
            Address::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(connect_error)?;
                // Frames are written whole; don't let Nagle hold back small ones.
                stream.set_nodelay(true).map_err(connect_error)?;
                trace!("TCP connection established to: {}", addr);
                Ok(Box::new(stream))
            }
            Address::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(connect_error)?;
                trace!("Unix connection established to: {:?}", path);
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tokio::net::{TcpListener, UnixListener};

    use super::*;

    #[test]
    fn test_address_parsing() {
        assert_eq!(
            Address::parse("tcp://127.0.0.1:9000").unwrap(),
            Address::Tcp("127.0.0.1:9000".into())
        );
        assert_eq!(
            Address::parse("unix:///tmp/nvim.sock").unwrap(),
            Address::Unix("/tmp/nvim.sock".into())
        );
        assert_eq!(
            Address::parse("/tmp/x").unwrap(),
            Address::Unix("/tmp/x".into())
        );
        assert_eq!(
            Address::parse("peer.sock").unwrap(),
            Address::Unix("peer.sock".into())
        );
        assert_eq!(
            Address::parse("localhost:6666").unwrap(),
            Address::Tcp("localhost:6666".into())
        );
        assert!(matches!(
            Address::parse("  "),
            Err(RpcError::Connect { .. })
        ));
        assert_eq!(
            Address::Tcp("h:1".into()).to_string(),
            "tcp://h:1".to_string()
        );
    }

    #[tokio::test]
    async fn test_connects_over_tcp_and_unix() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap().to_string();
        SocketConnector.connect(&addr).await.unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("peer.sock");
        let _unix = UnixListener::bind(&path).unwrap();
        SocketConnector
            .connect(path.to_str().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_names_address() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let address = path.to_string_lossy().to_string();
        match SocketConnector.connect(&address).await {
            Err(RpcError::Connect { address: reported, .. }) => assert_eq!(reported, address),
            Err(other) => panic!("expected connect error, got {:?}", other),
            Ok(_) => panic!("connect to a missing socket succeeded"),
        }
    }

    #[tokio::test]
    async fn test_blank_address_is_a_connect_error() {
        for address in ["", "   "] {
            match SocketConnector.connect(address).await {
                Err(RpcError::Connect {
                    address: reported,
                    source,
                }) => {
                    assert_eq!(reported, address);
                    assert_eq!(source.kind(), io::ErrorKind::InvalidInput);
                }
                Err(other) => panic!("expected connect error, got {:?}", other),
                Ok(_) => panic!("connect to a blank address succeeded"),
            }
        }
    }
}
