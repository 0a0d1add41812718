//! Bidirectional byte relay between a client and its backend.

use std::{fmt, io};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::stream::DuplexStream;

pub const BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Client to backend.
    Serverbound,
    /// Backend to client.
    Clientbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serverbound => f.write_str("serverbound"),
            Self::Clientbound => f.write_str("clientbound"),
        }
    }
}

/// Bytes moved in each direction over the life of a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub serverbound_bytes: u64,
    pub clientbound_bytes: u64,
}

/// A routed connection: the client, its backend, and the scope that ends both.
///
/// The scope is normally a child of the server's shutdown token, so either a
/// server shutdown or one side hanging up stops both copy loops together.
pub struct RelaySession<C, B> {
    client: C,
    backend: B,
    scope: CancellationToken,
}

struct Pumped<R, W> {
    reader: R,
    writer: W,
    bytes: u64,
}

impl<C, B> RelaySession<C, B>
where
    C: DuplexStream,
    B: DuplexStream,
{
    pub fn new(client: C, backend: B, scope: CancellationToken) -> Self {
        Self {
            client,
            backend,
            scope,
        }
    }

    /// Sends `initial` to the backend, then relays in both directions until
    /// either side closes, fails, or the scope is cancelled. Both streams are
    /// shut down before this returns.
    pub async fn run(self, initial: &[u8]) -> RelayStats {
        let Self {
            client,
            mut backend,
            scope,
        } = self;
        let mut stats = RelayStats::default();

        if !initial.is_empty() {
            let forwarded = tokio::select! {
                () = scope.cancelled() => Err(io::Error::from(io::ErrorKind::Interrupted)),
                result = write_chunk(&mut backend, initial) => result,
            };
            if let Err(e) = forwarded {
                debug!(error = %e, "Failed to forward handshake to backend");
                scope.cancel();
                close(client, backend).await;
                return stats;
            }
            stats.serverbound_bytes = initial.len() as u64;
        }

        let (client_reader, client_writer) = tokio::io::split(client);
        let (backend_reader, backend_writer) = tokio::io::split(backend);

        let serverbound = pump(
            Direction::Serverbound,
            client_reader,
            backend_writer,
            &scope,
        );
        let clientbound = pump(
            Direction::Clientbound,
            backend_reader,
            client_writer,
            &scope,
        );
        let (serverbound, clientbound) = tokio::join!(serverbound, clientbound);

        stats.serverbound_bytes += serverbound.bytes;
        stats.clientbound_bytes = clientbound.bytes;

        let client = rejoin(serverbound.reader, clientbound.writer);
        let backend = rejoin(clientbound.reader, serverbound.writer);
        close(client, backend).await;

        debug!(
            serverbound_bytes = stats.serverbound_bytes,
            clientbound_bytes = stats.clientbound_bytes,
            "Relay finished"
        );
        stats
    }
}

fn rejoin<T: AsyncRead + AsyncWrite + Unpin>(reader: ReadHalf<T>, writer: WriteHalf<T>) -> T {
    reader.unsplit(writer)
}

/// Copies one direction until it ends for any reason, then cancels the scope
/// so the opposite direction unwinds too.
async fn pump<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    scope: &CancellationToken,
) -> Pumped<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0;

    tokio::select! {
        () = scope.cancelled() => {
            trace!(%direction, "Relay direction cancelled");
        }
        result = copy_stream(&mut reader, &mut writer, &mut bytes) => match result {
            Ok(()) => debug!(%direction, "Relay source closed"),
            // Resets and broken pipes are how peers usually disconnect
            Err(e) => debug!(%direction, error = %e, "Relay direction failed"),
        },
    }

    scope.cancel();
    Pumped {
        reader,
        writer,
        bytes,
    }
}

async fn copy_stream<R, W>(reader: &mut R, writer: &mut W, transferred: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        write_chunk(writer, &buffer[..n]).await?;
        *transferred += n as u64;
        trace!(bytes = n, "Forwarded chunk");
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

async fn close<C: DuplexStream, B: DuplexStream>(mut client: C, mut backend: B) {
    if let Err(e) = client.shutdown().await {
        trace!(error = %e, "Client stream already closed");
    }
    if let Err(e) = backend.shutdown().await {
        trace!(error = %e, "Backend stream already closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::{
        io::{DuplexStream as MemoryStream, duplex},
        time::timeout,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);
    const PIPE_CAPACITY: usize = 1024;

    /// Starts a session over in-memory pipes and returns the far ends.
    fn start_session(
        initial: &'static [u8],
    ) -> (
        MemoryStream,
        MemoryStream,
        CancellationToken,
        tokio::task::JoinHandle<RelayStats>,
    ) {
        let (client_near, client_far) = duplex(PIPE_CAPACITY);
        let (backend_near, backend_far) = duplex(PIPE_CAPACITY);
        let scope = CancellationToken::new();

        let session = RelaySession::new(client_near, backend_near, scope.clone());
        let handle = tokio::spawn(async move { session.run(initial).await });

        (client_far, backend_far, scope, handle)
    }

    fn patterned_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    mod fidelity {
        use super::*;

        #[tokio::test]
        async fn forwards_initial_bytes_first() {
            let (mut client, mut backend, _scope, _handle) = start_session(b"\x05\x00hand");

            client.write_all(b"after").await.unwrap();

            let mut received = [0u8; 11];
            timeout(TEST_TIMEOUT, backend.read_exact(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&received, b"\x05\x00handafter");
        }

        #[tokio::test]
        async fn relays_large_payloads_both_ways() {
            let (client, backend, _scope, handle) = start_session(b"");
            let payload = patterned_payload(BUFFER_SIZE * 8 + 17);

            let (mut client_reader, mut client_writer) = tokio::io::split(client);
            let (mut backend_reader, mut backend_writer) = tokio::io::split(backend);

            let upload = tokio::spawn({
                let payload = payload.clone();
                async move { client_writer.write_all(&payload).await.unwrap() }
            });
            let download = tokio::spawn({
                let payload = payload.clone();
                async move { backend_writer.write_all(&payload).await.unwrap() }
            });

            let mut at_backend = vec![0u8; payload.len()];
            let mut at_client = vec![0u8; payload.len()];
            timeout(TEST_TIMEOUT, async {
                backend_reader.read_exact(&mut at_backend).await.unwrap();
                client_reader.read_exact(&mut at_client).await.unwrap();
            })
            .await
            .unwrap();

            upload.await.unwrap();
            download.await.unwrap();
            assert_eq!(at_backend, payload);
            assert_eq!(at_client, payload);

            drop(client_reader);
            timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn reports_bytes_moved() {
            let (mut client, mut backend, _scope, handle) = start_session(b"hi");

            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 6];
            backend.read_exact(&mut buf).await.unwrap();

            backend.write_all(b"pong!").await.unwrap();
            let mut buf = [0u8; 5];
            client.read_exact(&mut buf).await.unwrap();

            drop(client);
            let stats = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
            assert_eq!(
                stats,
                RelayStats {
                    serverbound_bytes: 6,
                    clientbound_bytes: 5,
                }
            );
        }
    }

    mod teardown {
        use super::*;

        #[tokio::test]
        async fn client_hangup_closes_backend() {
            let (client, mut backend, scope, handle) = start_session(b"x");
            drop(client);

            timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
            assert!(scope.is_cancelled());

            let mut rest = Vec::new();
            backend.read_to_end(&mut rest).await.unwrap();
            assert_eq!(rest, b"x");
        }

        #[tokio::test]
        async fn backend_hangup_closes_client() {
            let (mut client, backend, scope, handle) = start_session(b"");
            drop(backend);

            timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
            assert!(scope.is_cancelled());

            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        }

        #[tokio::test]
        async fn parent_cancellation_ends_both_directions() {
            let shutdown = CancellationToken::new();
            let (client_near, mut client) = duplex(PIPE_CAPACITY);
            let (backend_near, mut backend) = duplex(PIPE_CAPACITY);

            let session = RelaySession::new(client_near, backend_near, shutdown.child_token());
            let handle = tokio::spawn(async move { session.run(b"").await });

            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!handle.is_finished());

            shutdown.cancel();
            timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();

            let mut buf = [0u8; 1];
            assert_eq!(client.read(&mut buf).await.unwrap(), 0);
            assert_eq!(backend.read(&mut buf).await.unwrap(), 0);
        }

        #[tokio::test]
        async fn cancelled_scope_skips_relaying() {
            let (client_near, _client) = duplex(PIPE_CAPACITY);
            let (backend_near, _backend) = duplex(PIPE_CAPACITY);
            let scope = CancellationToken::new();
            scope.cancel();

            let stats = timeout(
                TEST_TIMEOUT,
                RelaySession::new(client_near, backend_near, scope).run(b""),
            )
            .await
            .unwrap();
            assert_eq!(stats, RelayStats::default());
        }
    }
}
