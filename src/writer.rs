//! Dedicated writer task per TCP connection.
//!
//! Sends are fire-and-forget: callers hand an encoded frame to the
//! connection's writer task through an unbounded mpsc channel and return
//! immediately. The task batches whatever is queued into vectored writes.
//!
//! # Architecture
//!
//! ```text
//! Facade send ─┐
//! Keepalive   ─┼─► mpsc::UnboundedSender<Bytes> ─► Writer Task ─► TCP write half
//! Rendezvous  ─┘
//! ```
//!
//! A write fault is logged and signals the connection's close `Notify`, so
//! the read loop tears the connection down and raises `Disconnected`. The
//! fault never reaches the caller of `send`.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{Result, TransportError};

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; every clone feeds the same connection.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    /// Channel sender for encoded frames.
    tx: mpsc::UnboundedSender<Bytes>,
    /// Frames queued but not yet written.
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Queue an encoded frame for writing.
    ///
    /// Returns `Disconnected` only if the writer task has already exited.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            TransportError::Disconnected
        })
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task is gone.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// `on_fault` is notified when a write fails.
pub fn spawn_writer_task<W>(writer: W, on_fault: Arc<Notify>) -> (WriterHandle, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
    };

    let task = tokio::spawn(async move {
        if let Err(e) = writer_loop(rx, writer, pending).await {
            tracing::warn!("Write failed, closing connection: {}", e);
            on_fault.notify_one();
        }
    });

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        // Wait for first frame
        let first = match rx.recv().await {
            Some(f) => f,
            None => return Ok(()),
        };

        batch.clear();
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);
        result?;
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, Arc::new(Notify::new()));

        handle.send(Bytes::from_static(b"\x03\x00\x00\x00\x00hi")).unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], b"\x03\x00\x00\x00\x00hi");
    }

    #[tokio::test]
    async fn test_writer_batching_preserves_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, Arc::new(Notify::new()));

        for i in 0..10u8 {
            handle.send(Bytes::from(vec![i; 3])).unwrap();
        }

        let mut buf = vec![0u8; 30];
        server.read_exact(&mut buf).await.unwrap();

        let expected: Vec<u8> = (0..10u8).flat_map(|i| [i; 3]).collect();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_send_after_task_exit_is_disconnected() {
        let (client, _server) = duplex(64);
        let (handle, task) = spawn_writer_task(client, Arc::new(Notify::new()));

        task.abort();
        let _ = task.await;

        let result = handle.send(Bytes::from_static(b"late"));
        assert!(matches!(result, Err(TransportError::Disconnected)));
        assert!(handle.is_closed());
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_write_fault_notifies() {
        let (client, server) = duplex(64);
        let fault = Arc::new(Notify::new());
        let (handle, _task) = spawn_writer_task(client, fault.clone());

        drop(server);
        handle.send(Bytes::from_static(b"into the void")).unwrap();

        tokio::time::timeout(Duration::from_secs(1), fault.notified())
            .await
            .expect("write fault was not signalled");
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")];

        assert_eq!(build_remaining_slices(&batch, 0).len(), 2);

        let partial = build_remaining_slices(&batch, 3);
        assert_eq!(partial.len(), 2);
        assert_eq!(&*partial[0], b"lo");

        let second_only = build_remaining_slices(&batch, 5);
        assert_eq!(second_only.len(), 1);
        assert_eq!(&*second_only[0], b"world");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| Bytes::from_static(b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 15);
    }
}
