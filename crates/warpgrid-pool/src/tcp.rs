//! Raw TCP client for byte-level passthrough.
//!
//! [`TcpClient`] implements [`PoolClient`] over a `tokio::net::TcpStream`
//! with no protocol awareness: callers write request bytes and read
//! response bytes themselves.
//!
//! # Architecture
//!
//! ```text
//! pool connect
//!   → TcpClient::connect(endpoints)
//!     → try each endpoint in order, bounded by connect_timeout
//!
//! work
//!   → TcpClient::send() → TCP write
//!   → TcpClient::recv() → TCP read (0 bytes = peer closed → client closed)
//! ```
//!
//! Any I/O error closes the client so the pool destroys it instead of
//! lending a broken stream to the next caller. [`PoolClient::is_closed`]
//! also peeks the socket without blocking, so a connection the peer
//! dropped while it sat idle is never lent out.

use std::net::SocketAddr;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::client::PoolClient;
use crate::error::ClientError;

/// Default bound on a single endpoint connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ── TcpClient ────────────────────────────────────────────────────────

/// A poolable TCP connection.
pub struct TcpClient {
    host: String,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    connect_timeout: Duration,
    closed: bool,
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("host", &self.host)
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .finish()
    }
}

impl TcpClient {
    pub fn new(host_name: &str, connect_timeout: Duration) -> Self {
        Self {
            host: host_name.to_string(),
            stream: None,
            peer: None,
            connect_timeout,
            closed: false,
        }
    }

    /// A factory producing clients with the given connect timeout.
    pub fn factory(
        connect_timeout: Duration,
    ) -> impl Fn(&str) -> TcpClient + Send + Sync + 'static {
        move |host: &str| TcpClient::new(host, connect_timeout)
    }

    /// The endpoint the current connection went to.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the peer has hung up, checked with a single non-blocking peek.
    ///
    /// EOF or a socket error means gone. Pending data or nothing to read yet
    /// means the connection is still up. Nothing is consumed.
    fn peer_gone(stream: &TcpStream) -> bool {
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        let mut cx = Context::from_waker(Waker::noop());
        match stream.poll_peek(&mut cx, &mut buf) {
            Poll::Ready(Ok(0)) => true,
            Poll::Ready(Ok(_)) => false,
            Poll::Ready(Err(e)) => {
                tracing::debug!(error = %e, "tcp liveness check failed");
                true
            }
            Poll::Pending => false,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, ClientError> {
        match self.stream.as_mut() {
            Some(stream) if !self.closed => Ok(stream),
            _ => Err(ClientError::Closed),
        }
    }

    /// Write all of `data`.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, ClientError> {
        let result = self.stream()?.write_all(data).await;
        match result {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                self.close();
                Err(ClientError::Io(e))
            }
        }
    }

    /// Read up to `max_bytes`. The peer closing the connection closes the client.
    pub async fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, ClientError> {
        let mut buf = vec![0u8; max_bytes];
        let result = self.stream()?.read(&mut buf).await;
        match result {
            Ok(0) if max_bytes > 0 => {
                self.close();
                Err(ClientError::Closed)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => {
                self.close();
                Err(ClientError::Io(e))
            }
        }
    }

    /// Read exactly `len` bytes.
    pub async fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>, ClientError> {
        let mut buf = vec![0u8; len];
        let result = self.stream()?.read_exact(&mut buf).await;
        match result {
            Ok(_) => Ok(buf),
            Err(e) => {
                self.close();
                Err(ClientError::Io(e))
            }
        }
    }
}

impl PoolClient for TcpClient {
    async fn connect(
        &mut self,
        host_name: &str,
        endpoints: &[SocketAddr],
    ) -> Result<(), ClientError> {
        let mut last_error = ClientError::NoEndpoints;

        for &addr in endpoints {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(host = %host_name, %addr, "tcp connected");
                    self.stream = Some(stream);
                    self.peer = Some(addr);
                    self.closed = false;
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::debug!(host = %host_name, %addr, error = %e, "tcp connect failed");
                    last_error = ClientError::Io(e);
                }
                Err(_) => {
                    tracing::debug!(host = %host_name, %addr, "tcp connect timed out");
                    last_error = ClientError::Timeout;
                }
            }
        }

        Err(last_error)
    }

    fn close(&mut self) {
        self.stream = None;
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        match &self.stream {
            Some(stream) if !self.closed => Self::peer_gone(stream),
            _ => true,
        }
    }

    fn host_name(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// An address nothing listens on.
    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn send_and_recv_round_trip() {
        let addr = echo_server().await;
        let mut client = TcpClient::new("echo", DEFAULT_CONNECT_TIMEOUT);
        client.connect("echo", &[addr]).await.unwrap();
        assert_eq!(client.peer_addr(), Some(addr));

        assert_eq!(client.send(b"hello").await.unwrap(), 5);
        assert_eq!(client.recv_exact(5).await.unwrap(), b"hello");
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn empty_endpoints_fail() {
        let mut client = TcpClient::new("nowhere", DEFAULT_CONNECT_TIMEOUT);
        let err = client.connect("nowhere", &[]).await.unwrap_err();
        assert!(matches!(err, ClientError::NoEndpoints));
    }

    #[tokio::test]
    async fn refused_connect_reports_io_error() {
        let addr = refused_addr().await;
        let mut client = TcpClient::new("down", DEFAULT_CONNECT_TIMEOUT);
        let err = client.connect("down", &[addr]).await.unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
    }

    #[tokio::test]
    async fn falls_through_to_next_endpoint() {
        let dead = refused_addr().await;
        let live = echo_server().await;
        let mut client = TcpClient::new("mixed", DEFAULT_CONNECT_TIMEOUT);
        client.connect("mixed", &[dead, live]).await.unwrap();
        assert_eq!(client.peer_addr(), Some(live));
    }

    #[tokio::test]
    async fn peer_close_closes_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut client = TcpClient::new("closing", DEFAULT_CONNECT_TIMEOUT);
        client.connect("closing", &[addr]).await.unwrap();
        let err = client.recv(16).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed | ClientError::Io(_)));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn idle_peer_close_is_detected_without_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut client = TcpClient::new("closing", DEFAULT_CONNECT_TIMEOUT);
        client.connect("closing", &[addr]).await.unwrap();
        // Give the server time to close.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn liveness_check_leaves_pending_data_unread() {
        let addr = echo_server().await;
        let mut client = TcpClient::new("echo", DEFAULT_CONNECT_TIMEOUT);
        client.connect("echo", &[addr]).await.unwrap();
        client.send(b"hi").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!client.is_closed());
        assert_eq!(client.recv_exact(2).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn unconnected_client_counts_as_closed() {
        assert!(TcpClient::new("idle", DEFAULT_CONNECT_TIMEOUT).is_closed());
    }

    #[tokio::test]
    async fn closed_client_rejects_io() {
        let addr = echo_server().await;
        let mut client = TcpClient::new("echo", DEFAULT_CONNECT_TIMEOUT);
        client.connect("echo", &[addr]).await.unwrap();
        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.send(b"x").await, Err(ClientError::Closed)));
    }
}
