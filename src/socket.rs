//! Socket abstraction for client connections.
//!
//! The gateway only ever writes to client sockets; the transport's accept
//! loop owns the read side. The trait keeps the sender pool testable and
//! lets the transport hand over whatever write half it manages.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;

static SOCKET_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a socket, used as registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn next() -> Self {
        Self(SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Duplex byte stream as seen from the gateway: write-only plus identity.
#[async_trait]
pub trait GatewaySocket: Send + Sync {
    fn id(&self) -> SocketId;

    /// Remote endpoint for logging; "unknown" once the socket is closed.
    fn remote_endpoint(&self) -> String;

    /// Write the buffers in order and flush. Returns the number of bytes
    /// written; fewer than the total means a short write.
    async fn send(&self, buffers: &[Bytes]) -> io::Result<usize>;

    async fn close(&self);
}

/// TCP implementation over the write half of an accepted connection.
pub struct TcpGatewaySocket {
    id: SocketId,
    peer: Mutex<Option<SocketAddr>>,
    writer: tokio::sync::Mutex<Option<BufWriter<OwnedWriteHalf>>>,
}

impl TcpGatewaySocket {
    pub fn new(write_half: OwnedWriteHalf, peer: SocketAddr) -> Self {
        Self {
            id: SocketId::next(),
            peer: Mutex::new(Some(peer)),
            writer: tokio::sync::Mutex::new(Some(BufWriter::new(write_half))),
        }
    }
}

#[async_trait]
impl GatewaySocket for TcpGatewaySocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn remote_endpoint(&self) -> String {
        match *self.peer.lock().expect("peer lock") {
            Some(addr) => addr.to_string(),
            None => "unknown".to_string(),
        }
    }

    async fn send(&self, buffers: &[Bytes]) -> io::Result<usize> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))?;

        let mut written = 0;
        for buffer in buffers {
            writer.write_all(buffer).await?;
            written += buffer.len();
        }
        writer.flush().await?;
        Ok(written)
    }

    async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
        *self.peer.lock().expect("peer lock") = None;
    }
}

impl std::fmt::Debug for TcpGatewaySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpGatewaySocket")
            .field("id", &self.id)
            .field("peer", &self.remote_endpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn socket_ids_are_unique() {
        let a = SocketId::next();
        let b = SocketId::next();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn tcp_socket_writes_buffers_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();

        let (mut read_half, _keep) = client.into_split();
        let (_accepted_read, write_half) = accepted.into_split();
        let socket = TcpGatewaySocket::new(write_half, peer);

        let written = socket
            .send(&[Bytes::from_static(b"abc"), Bytes::from_static(b"def")])
            .await
            .unwrap();
        assert_eq!(written, 6);

        let mut buf = [0u8; 6];
        read_half.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_hides_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        let (_read, write_half) = accepted.into_split();

        let socket = TcpGatewaySocket::new(write_half, peer);
        assert_eq!(socket.remote_endpoint(), peer.to_string());

        socket.close().await;
        socket.close().await;
        assert_eq!(socket.remote_endpoint(), "unknown");

        let err = socket.send(&[Bytes::from_static(b"x")]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
