use std::sync::Arc;
use bytes::Bytes;
use tracing::debug;

use crate::client_context::CompletionCallback;
use crate::config::TransferOptions;
use crate::handler::{TransferIo, TransferReader, TransferWriter};
use crate::status::Status;
use crate::stream::{ChunkWriter, TransferStream};
use crate::transfer_thread::{ClientTransferRequest, TransferThreadHandle};

/// Identifies a client transfer for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    id: u32,
}

impl TransferHandle {
    /// The transfer's session id (for versioned transfers, the id on the wire)
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Starts transfers to and from a remote transfer service
#[derive(Clone)]
pub struct TransferClient {
    thread: TransferThreadHandle,
}

impl TransferClient {
    pub fn new(thread: TransferThreadHandle) -> TransferClient {
        TransferClient { thread }
    }

    /// Reads the remote resource `resource_id` into `writer`. `on_completion` is called exactly
    ///  once with the final status, on the transfer thread.
    pub async fn read(&self,
                      resource_id: u32,
                      writer: impl TransferWriter + 'static,
                      options: TransferOptions,
                      on_completion: impl FnOnce(Status) + Send + 'static,
    ) -> anyhow::Result<TransferHandle> {
        self.start(resource_id, TransferIo::Writer(Box::new(writer)), options, Box::new(on_completion)).await
    }

    /// Writes the contents of `reader` to the remote resource `resource_id`
    pub async fn write(&self,
                       resource_id: u32,
                       reader: impl TransferReader + 'static,
                       options: TransferOptions,
                       on_completion: impl FnOnce(Status) + Send + 'static,
    ) -> anyhow::Result<TransferHandle> {
        self.start(resource_id, TransferIo::Reader(Box::new(reader)), options, Box::new(on_completion)).await
    }

    async fn start(&self, resource_id: u32, io: TransferIo, options: TransferOptions, on_completion: CompletionCallback) -> anyhow::Result<TransferHandle> {
        let handle_id = self.thread.allocate_session_id();
        debug!("starting {:?} transfer {} for resource {}", io.transfer_type(), handle_id, resource_id);

        self.thread.start_client_transfer(ClientTransferRequest {
            handle_id,
            resource_id,
            io,
            options,
            on_completion,
        }).await?;
        Ok(TransferHandle { id: handle_id })
    }

    /// Ends the transfer with `Cancelled` and tells the server. Transfers that already
    ///  finished are not affected.
    pub async fn cancel(&self, handle: TransferHandle) -> anyhow::Result<()> {
        self.thread.end_client_transfer(handle.id, Status::Cancelled, true).await
    }

    pub async fn set_read_stream(&self, writer: Arc<dyn ChunkWriter>) -> anyhow::Result<()> {
        self.thread.set_stream(TransferStream::ClientRead, writer).await
    }

    pub async fn set_write_stream(&self, writer: Arc<dyn ChunkWriter>) -> anyhow::Result<()> {
        self.thread.set_stream(TransferStream::ClientWrite, writer).await
    }

    /// Hands a chunk the server sent on the read stream to the transfer thread
    pub async fn process_read_chunk(&self, chunk: Bytes) -> anyhow::Result<()> {
        self.thread.process_chunk(TransferStream::ClientRead, chunk).await
    }

    pub async fn process_write_chunk(&self, chunk: Bytes) -> anyhow::Result<()> {
        self.thread.process_chunk(TransferStream::ClientWrite, chunk).await
    }
}
