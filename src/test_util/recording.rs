use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::chunk::Chunk;
use crate::status::Status;
use crate::stream::ChunkWriter;

/// A [ChunkWriter] that hands every written chunk to a [SentChunks] queue
pub struct RecordingChunkWriter {
    sent: mpsc::UnboundedSender<Bytes>,
    cancelled: Arc<AtomicBool>,
}

impl RecordingChunkWriter {
    pub fn new() -> (RecordingChunkWriter, SentChunks) {
        let (send, recv) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let writer = RecordingChunkWriter {
            sent: send,
            cancelled: cancelled.clone(),
        };
        let sent = SentChunks {
            received: recv,
            cancelled,
        };
        (writer, sent)
    }
}

#[async_trait]
impl ChunkWriter for RecordingChunkWriter {
    async fn write(&self, chunk: &[u8]) -> anyhow::Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(anyhow!("stream was cancelled"));
        }
        self.sent.send(Bytes::copy_from_slice(chunk))
            .map_err(|_| anyhow!("nobody is recording"))
    }

    async fn finish(&self, _status: Status) {}

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

pub struct SentChunks {
    received: mpsc::UnboundedReceiver<Bytes>,
    cancelled: Arc<AtomicBool>,
}

impl SentChunks {
    /// Waits for the next chunk. With paused time, waiting lets pending timeouts fire.
    pub async fn next(&mut self) -> Chunk {
        let raw = self.next_raw().await
            .expect("all chunk writers were dropped");
        Chunk::decode(raw)
            .expect("an invalid chunk was sent")
    }

    pub async fn next_raw(&mut self) -> Option<Bytes> {
        self.received.recv().await
    }

    pub fn try_next(&mut self) -> Option<Chunk> {
        let raw = self.received.try_recv().ok()?;
        Some(Chunk::decode(raw).expect("an invalid chunk was sent"))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
