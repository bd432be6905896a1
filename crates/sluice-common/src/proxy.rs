use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::TunnelError;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Byte counters for a bridged pair of connections
#[derive(Debug, Default, Clone)]
pub struct ProxyStats {
    a_to_b: Arc<AtomicU64>,
    b_to_a: Arc<AtomicU64>,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes copied from the first connection to the second
    pub fn a_to_b(&self) -> u64 {
        self.a_to_b.load(Ordering::Relaxed)
    }

    /// Bytes copied from the second connection to the first
    pub fn b_to_a(&self) -> u64 {
        self.b_to_a.load(Ordering::Relaxed)
    }

    pub fn a_to_b_counter(&self) -> Arc<AtomicU64> {
        self.a_to_b.clone()
    }

    pub fn b_to_a_counter(&self) -> Arc<AtomicU64> {
        self.b_to_a.clone()
    }
}

/// Copy `reader` into `writer` until EOF, counting bytes as they go
///
/// The writer is shut down once the reader reaches EOF so the far side sees
/// the end of the stream.
pub async fn copy_counted<R, W>(mut reader: R, mut writer: W, counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }

    let _ = writer.shutdown().await;
    Ok(total)
}

/// Bridge two connections with plain byte copies in both directions
pub async fn proxy_bidirectional<A, B>(
    cancel: &CancellationToken,
    a: A,
    b: B,
    stats: &ProxyStats,
) -> Result<(), TunnelError>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let forward_counter = stats.a_to_b_counter();
    let backward_counter = stats.b_to_a_counter();

    proxy_with(
        cancel,
        a,
        b,
        move |reader, writer| async move { copy_counted(reader, writer, &forward_counter).await },
        move |reader, writer| async move { copy_counted(reader, writer, &backward_counter).await },
    )
    .await
}

/// Bridge two connections with caller-supplied copy routines
///
/// `forward` moves bytes from `a` to `b`, `backward` from `b` to `a`; each runs
/// on its own task. The bridge ends as soon as either direction finishes or
/// `cancel` fires. Both tasks are then aborted, which drops the connection
/// halves and releases any I/O still blocked on them. The first error
/// observed is returned; cancellation wins over a simultaneous copy error.
pub async fn proxy_with<A, B, F, G, FFut, GFut>(
    cancel: &CancellationToken,
    a: A,
    b: B,
    forward: F,
    backward: G,
) -> Result<(), TunnelError>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
    F: FnOnce(ReadHalf<A>, WriteHalf<B>) -> FFut,
    G: FnOnce(ReadHalf<B>, WriteHalf<A>) -> GFut,
    FFut: Future<Output = io::Result<u64>> + Send + 'static,
    GFut: Future<Output = io::Result<u64>> + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let mut forward_task = tokio::spawn(forward(a_read, b_write));
    let mut backward_task = tokio::spawn(backward(b_read, a_write));

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        res = &mut forward_task => copy_outcome(res),
        res = &mut backward_task => copy_outcome(res),
    };

    forward_task.abort();
    backward_task.abort();

    if cancel.is_cancelled() {
        return Err(TunnelError::Cancelled);
    }
    result
}

fn copy_outcome(res: Result<io::Result<u64>, JoinError>) -> Result<(), TunnelError> {
    match res {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(TunnelError::Io(e)),
        Err(e) => Err(TunnelError::Io(io::Error::other(e))),
    }
}
