//! Pluggable transports
//!
//! A [`Connector`] dials one endpoint and yields a bidirectional byte
//! stream. TCP and Unix-socket connectors are built in; TLS (and anything
//! else, such as in-memory streams for tests) plugs in through the trait.

use async_trait::async_trait;
use redis_keel_core::{
    config::{ConnectionConfig, RedisTarget},
    error::{RedisError, RedisResult},
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Byte stream between the client and one Redis server.
pub trait ChannelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelStream for T {}

/// A boxed transport stream.
pub type BoxedStream = Box<dyn ChannelStream>;

/// Dials the configured endpoint. Each successful call produces a fresh
/// channel; the watchdog calls this on every reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new channel.
    async fn connect(&self) -> RedisResult<BoxedStream>;
}

/// Plain TCP transport with optional keepalive.
pub struct TcpConnector {
    config: ConnectionConfig,
}

impl TcpConnector {
    /// Create a TCP connector from a connection configuration.
    pub fn new(config: ConnectionConfig) -> RedisResult<Self> {
        match config.url.target {
            RedisTarget::Tcp { .. } => Ok(Self { config }),
            ref other => Err(RedisError::Config(format!(
                "TcpConnector cannot dial {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> RedisResult<BoxedStream> {
        let addr = self.config.url.address();
        debug!("connecting to redis at {addr}");

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(|e| RedisError::Connection(format!("failed to connect to {addr}: {e}")))?;

        let stream = if let Some(interval) = self.config.tcp_keepalive {
            let socket = socket2::Socket::from(stream.into_std()?);
            let keepalive = socket2::TcpKeepalive::new().with_time(interval);
            socket
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| RedisError::Connection(format!("failed to set keepalive: {e}")))?;
            TcpStream::from_std(socket.into())?
        } else {
            stream
        };

        Ok(Box::new(stream))
    }
}

/// Unix domain socket transport.
#[cfg(unix)]
pub struct UnixConnector {
    config: ConnectionConfig,
}

#[cfg(unix)]
impl UnixConnector {
    /// Create a Unix-socket connector from a connection configuration.
    pub fn new(config: ConnectionConfig) -> RedisResult<Self> {
        match config.url.target {
            RedisTarget::Unix { .. } => Ok(Self { config }),
            ref other => Err(RedisError::Config(format!(
                "UnixConnector cannot dial {other:?}"
            ))),
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> RedisResult<BoxedStream> {
        let path = match &self.config.url.target {
            RedisTarget::Unix { path } => path.clone(),
            other => {
                return Err(RedisError::Config(format!(
                    "UnixConnector cannot dial {other:?}"
                )))
            }
        };
        debug!("connecting to redis socket at {path}");

        let stream = timeout(
            self.config.connect_timeout,
            tokio::net::UnixStream::connect(&path),
        )
        .await
        .map_err(|_| RedisError::Timeout)?
        .map_err(|e| RedisError::Connection(format!("failed to connect to {path}: {e}")))?;

        Ok(Box::new(stream))
    }
}

/// Pick the built-in connector matching the configured target.
pub fn connector_for(config: &ConnectionConfig) -> RedisResult<Arc<dyn Connector>> {
    match &config.url.target {
        RedisTarget::Tcp { .. } => Ok(Arc::new(TcpConnector::new(config.clone())?)),
        #[cfg(unix)]
        RedisTarget::Unix { .. } => Ok(Arc::new(UnixConnector::new(config.clone())?)),
        #[cfg(not(unix))]
        RedisTarget::Unix { .. } => Err(RedisError::Config(
            "unix sockets are not supported on this platform".to_string(),
        )),
        RedisTarget::Tls { .. } => Err(RedisError::Config(
            "no built-in TLS transport; supply a custom Connector".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_for_tcp() {
        let config = ConnectionConfig::new("redis://localhost:6379").unwrap();
        assert!(connector_for(&config).is_ok());
    }

    #[test]
    fn test_connector_for_tls_requires_plugin() {
        let config = ConnectionConfig::new("rediss://localhost:6379").unwrap();
        assert!(connector_for(&config).is_err());
    }

    #[test]
    fn test_tcp_connector_rejects_unix_target() {
        let config = ConnectionConfig::new("redis-socket:///tmp/redis.sock").unwrap();
        assert!(TcpConnector::new(config).is_err());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // bind then drop to find a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ConnectionConfig::new(format!("redis://127.0.0.1:{port}")).unwrap();
        let connector = TcpConnector::new(config).unwrap();
        assert!(connector.connect().await.is_err());
    }
}
