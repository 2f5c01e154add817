//! Inbound stream processor.
//!
//! One task per established channel. It reads with a bounded deadline,
//! stamps liveness on every nonzero read, and hands raw chunks to the
//! decoding collaborator. A deadline expiry is only a chance to observe
//! cancellation; it is not an error and is not reported.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::IoError;
use crate::node::{LinkLoss, NodeCore, TaskRole};

/// Default per-read deadline.
pub const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(5);

/// Default inbound read buffer size.
pub const DEFAULT_READ_BUFFER: usize = 4096;

/// Raw bytes received from a peer, as delivered to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChunk {
    /// Node the bytes arrived on
    pub node_id: String,
    /// Unmodified payload bytes
    pub payload: Bytes,
    /// Receipt time
    pub received_at: Instant,
}

/// Result of one deadline-bounded read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were read into the buffer
    Data(usize),
    /// Nothing arrived before the deadline
    Idle,
    /// Peer closed the stream
    Eof,
    /// Fatal I/O error
    Failed(io::Error),
}

/// A read that gives up after a deadline so the caller can poll for
/// cancellation. Swap the implementation for transports with a native
/// cancellable read.
#[async_trait]
pub trait DeadlineRead: Send {
    /// Read into `buf`, waiting at most `deadline`.
    async fn read_within(&mut self, buf: &mut [u8], deadline: Duration) -> ReadOutcome;
}

#[async_trait]
impl<R> DeadlineRead for R
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_within(&mut self, buf: &mut [u8], deadline: Duration) -> ReadOutcome {
        match tokio::time::timeout(deadline, self.read(buf)).await {
            Err(_elapsed) => ReadOutcome::Idle,
            Ok(Ok(0)) => ReadOutcome::Eof,
            Ok(Ok(n)) => ReadOutcome::Data(n),
            // A socket-level TimedOut (e.g. failed keep-alive probes) is fatal.
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                ReadOutcome::Idle
            }
            Ok(Err(e)) => ReadOutcome::Failed(e),
        }
    }
}

/// Inbound processor bound to one connection epoch.
pub(crate) struct InboundProcessor<R> {
    pub(crate) core: Arc<NodeCore>,
    pub(crate) epoch: u64,
    pub(crate) reader: R,
    pub(crate) token: CancellationToken,
    pub(crate) read_deadline: Duration,
    pub(crate) buffer_size: usize,
    pub(crate) sink: Option<mpsc::Sender<InboundChunk>>,
}

impl<R: DeadlineRead> InboundProcessor<R> {
    pub(crate) async fn run(mut self) {
        let node_id = self.core.id().to_string();
        let mut buf = vec![0u8; self.buffer_size];

        let loss = loop {
            let outcome = tokio::select! {
                biased;
                _ = self.token.cancelled() => break LinkLoss::Cancelled,
                outcome = self.reader.read_within(&mut buf, self.read_deadline) => outcome,
            };

            match outcome {
                ReadOutcome::Idle => {
                    trace!(node_id = %node_id, "read deadline elapsed");
                }
                ReadOutcome::Data(n) => {
                    let received_at = Instant::now();
                    self.core.record_activity(self.epoch, received_at);
                    debug!(node_id = %node_id, bytes = n, "inbound chunk");

                    if let Some(sink) = &self.sink {
                        let chunk = InboundChunk {
                            node_id: node_id.clone(),
                            payload: Bytes::copy_from_slice(&buf[..n]),
                            received_at,
                        };
                        let delivered = tokio::select! {
                            biased;
                            _ = self.token.cancelled() => break LinkLoss::Cancelled,
                            sent = sink.send(chunk) => sent.is_ok(),
                        };
                        if !delivered {
                            debug!(node_id = %node_id, "decoder dropped, discarding inbound data");
                            self.sink = None;
                        }
                    }
                }
                ReadOutcome::Eof => break LinkLoss::PeerClosed,
                ReadOutcome::Failed(source) => {
                    let err = IoError::Read {
                        node_id: node_id.clone(),
                        source,
                    };
                    warn!(node_id = %node_id, error = %err, "inbound channel failed");
                    break LinkLoss::Io(err);
                }
            }
        };

        // Release the read half before handing off to teardown.
        drop(self.reader);
        self.core
            .terminate(self.epoch, TaskRole::Inbound, loss)
            .await;
    }
}
