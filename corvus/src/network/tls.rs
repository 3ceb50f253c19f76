//! The TLS seam.
//!
//! The driver does not implement a handshake itself; it only consumes a
//! "wrap a stream" contract. Any TLS stack (or a test double) can be plugged
//! in by implementing [TlsWrapper]; certificate validation happens entirely
//! inside the wrapper.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream the connection router can drive.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// Upgrades a freshly connected TCP stream to an encrypted one.
#[async_trait]
pub trait TlsWrapper: Send + Sync {
    async fn wrap(&self, stream: TcpStream) -> std::io::Result<Box<dyn SessionStream>>;
}
