//! Outbound dispatcher.
//!
//! Broadcast callers never touch the channel. They enqueue whole payloads on
//! a bounded queue and a single writer task drains it, so two payloads can
//! never interleave on the wire.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::IoError;
use crate::node::{LinkLoss, NodeCore, TaskRole};

/// Default outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Upper bound on the close_notify write during a clean shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Sending side of a connection's outbound queue.
#[derive(Debug, Clone)]
pub(crate) struct OutboundQueue {
    tx: mpsc::Sender<Bytes>,
}

impl OutboundQueue {
    pub(crate) fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a payload, waiting for room. Fails once the dispatcher is gone.
    pub(crate) async fn enqueue(&self, payload: Bytes) -> Result<(), Bytes> {
        self.tx.send(payload).await.map_err(|e| e.0)
    }
}

/// Single writer for one connection epoch.
pub(crate) struct Dispatcher<W> {
    pub(crate) core: Arc<NodeCore>,
    pub(crate) epoch: u64,
    pub(crate) writer: W,
    pub(crate) queue: mpsc::Receiver<Bytes>,
    pub(crate) token: CancellationToken,
}

impl<W: AsyncWrite + Unpin + Send> Dispatcher<W> {
    pub(crate) async fn run(mut self) {
        let node_id = self.core.id().to_string();

        let failure = loop {
            let payload = tokio::select! {
                biased;
                _ = self.token.cancelled() => break None,
                next = self.queue.recv() => match next {
                    Some(payload) => payload,
                    None => break None,
                },
            };

            // The write is abandoned only when the whole channel is being torn
            // down, so a truncated payload can never be followed by another.
            let written = tokio::select! {
                biased;
                _ = self.token.cancelled() => break None,
                written = write_payload(&mut self.writer, &payload) => written,
            };

            match written {
                Ok(()) => debug!(node_id = %node_id, bytes = payload.len(), "payload written"),
                Err(source) => {
                    break Some(IoError::Write {
                        node_id: node_id.clone(),
                        source,
                    })
                }
            }
        };

        self.queue.close();

        match failure {
            None => {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.writer.shutdown()).await;
            }
            Some(err) => {
                warn!(node_id = %node_id, error = %err, "outbound channel failed");
                drop(self.writer);
                self.core
                    .terminate(self.epoch, TaskRole::Dispatcher, LinkLoss::Io(err))
                    .await;
            }
        }
    }
}

async fn write_payload<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_payload_is_whole() {
        let (mut near, mut far) = tokio::io::duplex(8);
        let payload = Bytes::from_static(b"0123456789abcdef");

        let reader = tokio::spawn(async move {
            let mut out = vec![0u8; 16];
            far.read_exact(&mut out).await.unwrap();
            out
        });

        write_payload(&mut near, &payload).await.unwrap();
        assert_eq!(reader.await.unwrap(), payload.to_vec());
    }

    #[tokio::test]
    async fn test_enqueue_fails_after_receiver_dropped() {
        let (queue, rx) = OutboundQueue::bounded(2);
        queue.enqueue(Bytes::from_static(b"a")).await.unwrap();
        drop(rx);

        let rejected = queue.enqueue(Bytes::from_static(b"b")).await.unwrap_err();
        assert_eq!(rejected, Bytes::from_static(b"b"));
    }
}
