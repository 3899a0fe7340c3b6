use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::context::{TransferSide, TransferType};
use crate::status::Status;

/// The outbound half of one of the four RPC streams that carry chunks. Implementations wrap
///  whatever transport the application uses.
///
/// Writing must not wait for the transfer thread that calls it, since that thread is blocked
///  until the write returns.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChunkWriter: Send + Sync + 'static {
    async fn write(&self, chunk: &[u8]) -> anyhow::Result<()>;

    /// Closes the stream with a final status
    async fn finish(&self, status: Status);

    /// Tears the stream down without a status, e.g. when the transfer thread terminates
    fn cancel(&self);
}

/// The streams are named from the client's perspective: a client read is served by the server
///  on the `ServerRead` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStream {
    ClientRead,
    ClientWrite,
    ServerRead,
    ServerWrite,
}

impl TransferStream {
    pub fn for_transfer(side: TransferSide, transfer_type: TransferType) -> TransferStream {
        match (side, transfer_type) {
            (TransferSide::Client, TransferType::Receive) => TransferStream::ClientRead,
            (TransferSide::Client, TransferType::Transmit) => TransferStream::ClientWrite,
            (TransferSide::Server, TransferType::Transmit) => TransferStream::ServerRead,
            (TransferSide::Server, TransferType::Receive) => TransferStream::ServerWrite,
        }
    }

    pub fn side(&self) -> TransferSide {
        match self {
            TransferStream::ClientRead | TransferStream::ClientWrite => TransferSide::Client,
            TransferStream::ServerRead | TransferStream::ServerWrite => TransferSide::Server,
        }
    }

    /// The role of the local session that chunks on this stream belong to
    pub fn transfer_type(&self) -> TransferType {
        match self {
            TransferStream::ClientRead | TransferStream::ServerWrite => TransferType::Receive,
            TransferStream::ClientWrite | TransferStream::ServerRead => TransferType::Transmit,
        }
    }

    fn index(&self) -> usize {
        match self {
            TransferStream::ClientRead => 0,
            TransferStream::ClientWrite => 1,
            TransferStream::ServerRead => 2,
            TransferStream::ServerWrite => 3,
        }
    }
}

#[derive(Default)]
pub(crate) struct StreamSet {
    writers: [Option<Arc<dyn ChunkWriter>>; 4],
}

impl StreamSet {
    pub fn get(&self, stream: TransferStream) -> Option<&Arc<dyn ChunkWriter>> {
        self.writers[stream.index()].as_ref()
    }

    pub fn set(&mut self, stream: TransferStream, writer: Option<Arc<dyn ChunkWriter>>) {
        self.writers[stream.index()] = writer;
    }

    pub fn cancel_all(&mut self) {
        for writer in self.writers.iter_mut().filter_map(|w| w.take()) {
            writer.cancel();
        }
    }
}
