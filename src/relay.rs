//! Bidirectional byte relay for one bridge session.

use crate::sniff;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum bytes moved per read.
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound on flushing close_notify to each side during teardown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => f.write_str("local->ukey host"),
            Self::UpstreamToClient => f.write_str("ukey host->local"),
        }
    }
}

/// Why a direction stopped.
#[derive(Debug)]
pub enum PipeEnd {
    Eof,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

/// Result of one direction, returned by whichever finishes first.
#[derive(Debug)]
pub struct PipeOutcome {
    pub direction: Direction,
    pub bytes: u64,
    pub end: PipeEnd,
}

/// Copy `reader` into `writer` chunk by chunk until EOF or an error.
///
/// Each chunk is written and flushed before the next read, in the order read.
pub async fn pipe<R, W>(reader: &mut R, writer: &mut W, direction: Direction) -> PipeOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break PipeEnd::Eof,
            Ok(n) => n,
            Err(e) => break PipeEnd::ReadFailed(e),
        };
        let chunk = &buf[..n];

        debug!("[{}] {}", direction, sniff::describe(chunk));

        if let Err(e) = writer.write_all(chunk).await {
            break PipeEnd::WriteFailed(e);
        }
        if let Err(e) = writer.flush().await {
            break PipeEnd::WriteFailed(e);
        }
        bytes += n as u64;
    };

    PipeOutcome {
        direction,
        bytes,
        end,
    }
}

/// Relay between `client` and `upstream` until either direction stops.
///
/// The other direction is cancelled, both write sides are shut down (bounded
/// by [`SHUTDOWN_GRACE`]) and both streams are dropped before returning.
pub async fn relay<C, U>(client: C, upstream: U) -> PipeOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

    let first = tokio::select! {
        outcome = pipe(&mut client_rx, &mut upstream_tx, Direction::ClientToUpstream) => outcome,
        outcome = pipe(&mut upstream_rx, &mut client_tx, Direction::UpstreamToClient) => outcome,
    };

    debug!(
        "[{}] stopped after {} bytes: {:?}",
        first.direction, first.bytes, first.end
    );

    let teardown = async {
        let _ = upstream_tx.shutdown().await;
        let _ = client_tx.shutdown().await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, teardown).await.is_err() {
        debug!("Shutdown grace period elapsed, dropping sockets");
    }

    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::time::timeout;

    async fn read_to_end<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_pipe_forwards_exact_bytes() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = &data[..];
        let mut writer = Vec::new();

        let outcome = pipe(&mut reader, &mut writer, Direction::ClientToUpstream).await;

        assert!(matches!(outcome.end, PipeEnd::Eof));
        assert_eq!(outcome.bytes, data.len() as u64);
        assert_eq!(writer, data);
    }

    #[tokio::test]
    async fn test_relay_is_byte_faithful_both_ways() {
        let (client_near, client_far) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);
        let session = tokio::spawn(relay(client_near, upstream_far));

        let to_upstream: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let to_client: Vec<u8> = (0..30_000u32).map(|i| (i * 13 % 256) as u8).collect();

        let (mut client_rx, mut client_tx) = tokio::io::split(client_far);
        let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream_near);

        let expected_up = to_upstream.clone();
        let upstream_side = tokio::spawn(async move {
            let mut received = vec![0u8; expected_up.len()];
            upstream_rx.read_exact(&mut received).await.unwrap();
            upstream_tx.write_all(&to_client).await.unwrap();
            received
        });

        for chunk in to_upstream.chunks(777) {
            client_tx.write_all(chunk).await.unwrap();
        }
        let mut received_by_client = vec![0u8; 30_000];
        client_rx.read_exact(&mut received_by_client).await.unwrap();

        assert_eq!(upstream_side.await.unwrap(), to_upstream);
        assert_eq!(
            received_by_client,
            (0..30_000u32).map(|i| (i * 13 % 256) as u8).collect::<Vec<_>>()
        );

        drop(client_tx);
        drop(client_rx);
        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_eof_cancels_other_direction() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);
        let session = tokio::spawn(relay(client_near, upstream_far));

        client_far.write_all(b"bye").await.unwrap();
        client_far.shutdown().await.unwrap();

        // Upstream never answers; the relay must still finish.
        let outcome = timeout(Duration::from_secs(3), session)
            .await
            .expect("relay did not stop")
            .unwrap();
        assert_eq!(outcome.direction, Direction::ClientToUpstream);
        assert!(matches!(outcome.end, PipeEnd::Eof));
        assert_eq!(outcome.bytes, 3);

        // Both far ends observe closure.
        let upstream_seen = timeout(Duration::from_secs(1), read_to_end(upstream_near))
            .await
            .unwrap();
        assert_eq!(upstream_seen, b"bye");
        let client_seen = timeout(Duration::from_secs(1), read_to_end(client_far))
            .await
            .unwrap();
        assert!(client_seen.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_close_ends_session() {
        let (client_near, _client_far) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);
        let session = tokio::spawn(relay(client_near, upstream_far));

        drop(upstream_near);

        let outcome = timeout(Duration::from_secs(3), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.direction, Direction::UpstreamToClient);
    }
}
