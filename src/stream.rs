use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream the proxy can read a handshake from and relay
/// through.
///
/// Implemented for every owned, sendable [`AsyncRead`] + [`AsyncWrite`], so TCP
/// sockets and in-memory pipes such as [`tokio::io::duplex`] both qualify.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
