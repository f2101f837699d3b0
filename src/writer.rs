//! Dedicated writer task for outbound frames.
//!
//! Callers never touch the socket. They encode a frame into an
//! [`OutboundFrame`] and push it onto a bounded mpsc queue; one writer task
//! per socket session drains the queue and batches frames into vectored writes.
//!
//! # Architecture
//!
//! ```text
//! publish ────┐
//! subscribe ──┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket
//! reader PONG ┘
//! ```
//!
//! The queue outlives a session. Its receiver sits behind an async mutex that
//! each writer task holds for its lifetime, so after a reconnect the next
//! writer picks up exactly where the previous one stopped: frames queued
//! during the outage are written in their original order. A batch that was
//! being written when the socket failed is not retried, and PINGs queued
//! for an earlier socket are skipped (see [`PongTracker`]).

use std::io::IoSlice;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backpressure::BackpressureController;
use crate::error::{NatsError, Result};
use crate::keepalive::PongTracker;
use crate::protocol::{Frame, CRLF};

/// Extra queue slots reserved for control frames beyond the caller limit.
const CONTROL_HEADROOM: usize = 256;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Shared receiving end of the outbound queue.
pub(crate) type OutboundQueue = Arc<Mutex<mpsc::Receiver<OutboundFrame>>>;

/// A frame ready to be written to the socket.
///
/// The control line (and header block) is encoded up front; the payload is
/// kept as the caller's `Bytes` so it is never copied.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Control line, plus the header block for HPUB.
    pub head: Bytes,
    /// Payload for PUB/HPUB, followed on the wire by CRLF.
    pub body: Option<Bytes>,
    /// Session epoch of a tracked PING; `None` for every other frame.
    pub epoch: Option<u64>,
}

impl OutboundFrame {
    /// Encode a frame for the writer.
    pub fn encode(frame: &Frame) -> Result<Self> {
        let mut head = BytesMut::with_capacity(64);
        frame.encode_head(&mut head)?;
        Ok(Self {
            head: head.freeze(),
            body: frame.payload().cloned(),
            epoch: None,
        })
    }

    /// A PING whose PONG belongs to the socket of `epoch`.
    pub(crate) fn ping(epoch: u64) -> Self {
        Self {
            head: Bytes::from_static(b"PING\r\n"),
            body: None,
            epoch: Some(epoch),
        }
    }

    /// Whether this is a PING registered before the current socket.
    #[inline]
    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch.is_some_and(|e| e != epoch)
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.head.len() + self.body.as_ref().map_or(0, |b| b.len() + CRLF.len())
    }

    /// The wire segments of this frame, in order.
    fn segments(&self) -> [&[u8]; 3] {
        match &self.body {
            Some(body) => [&self.head, body, CRLF],
            None => [&self.head, &[], &[]],
        }
    }
}

/// Handle for queueing frames to the writer task.
///
/// This is cheaply cloneable and shared by the client, the reader and the
/// supervisor.
#[derive(Clone)]
pub struct WriterHandle {
    /// Channel sender for frames.
    tx: mpsc::Sender<OutboundFrame>,
    /// Pending frame accounting.
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Queue a caller frame without waiting.
    ///
    /// Returns `Err(Capacity)` immediately if the buffer is full.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.backpressure.try_reserve()?;

        self.tx.try_send(frame).map_err(|e| {
            self.backpressure.release();
            match e {
                mpsc::error::TrySendError::Full(_) => NatsError::Capacity,
                mpsc::error::TrySendError::Closed(_) => NatsError::ConnectionClosed,
            }
        })
    }

    /// Queue a protocol control frame, bypassing the caller limit.
    ///
    /// Waits only if the control headroom itself is exhausted.
    pub async fn send_control(&self, frame: OutboundFrame) -> Result<()> {
        self.backpressure.reserve_control();

        self.tx.send(frame).await.map_err(|_| {
            self.backpressure.release();
            NatsError::ConnectionClosed
        })
    }

    /// Check if the caller limit is currently reached.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }

    pub(crate) fn backpressure(&self) -> &BackpressureController {
        &self.backpressure
    }
}

/// Create the outbound queue for a connection.
///
/// Returns the sending handle and the shared receiver that writer tasks lock.
pub(crate) fn outbound_queue(max_pending_frames: usize) -> (WriterHandle, OutboundQueue) {
    let (tx, rx) = mpsc::channel(max_pending_frames.max(1) + CONTROL_HEADROOM);
    let handle = WriterHandle {
        tx,
        backpressure: BackpressureController::new(max_pending_frames),
    };
    (handle, Arc::new(Mutex::new(rx)))
}

/// Spawn a writer task for one socket session.
///
/// The task ends when `cancel` fires, the queue is closed, or a write fails.
pub(crate) fn spawn_writer_task<W>(
    queue: OutboundQueue,
    writer: W,
    backpressure: BackpressureController,
    pongs: Arc<PongTracker>,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(writer_loop(queue, writer, backpressure, pongs, cancel))
}

/// Main writer loop - receives frames and writes them to the socket.
///
/// Uses batching and scatter/gather I/O (writev) for efficiency.
async fn writer_loop<W>(
    queue: OutboundQueue,
    mut writer: W,
    backpressure: BackpressureController,
    pongs: Arc<PongTracker>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut rx = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        rx = queue.lock() => rx,
    };

    loop {
        // Wait for first frame
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => return Ok(()),
            },
        };

        // Collect additional ready frames (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        // Slots are released on dequeue: a failed batch is dropped, not retried.
        backpressure.release_many(batch.len());

        let epoch = pongs.epoch();
        batch.retain(|frame| !frame.is_stale(epoch));
        if batch.is_empty() {
            continue;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = write_batch(&mut writer, &batch) => result?,
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(NatsError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut offset = 0;

    for frame in batch {
        for segment in frame.segments() {
            if segment.is_empty() {
                continue;
            }
            let end = offset + segment.len();
            if skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&segment[start..]));
            }
            offset = end;
        }
    }

    slices
}
