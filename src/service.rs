use std::sync::Arc;
use bytes::Bytes;

use crate::handler::Handler;
use crate::status::Status;
use crate::stream::{ChunkWriter, TransferStream};
use crate::transfer_thread::TransferThreadHandle;

/// Serves registered resources to remote transfer clients
#[derive(Clone)]
pub struct TransferService {
    thread: TransferThreadHandle,
}

impl TransferService {
    pub fn new(thread: TransferThreadHandle) -> TransferService {
        TransferService { thread }
    }

    pub async fn register_handler(&self, handler: Handler) -> anyhow::Result<()> {
        self.thread.add_handler(handler).await
    }

    /// Unregisters a resource. Its ongoing transfers end with `Aborted`.
    pub async fn unregister_handler(&self, resource_id: u32) -> anyhow::Result<()> {
        self.thread.remove_handler(resource_id).await
    }

    /// The stream on which clients read resources
    pub async fn set_read_stream(&self, writer: Arc<dyn ChunkWriter>) -> anyhow::Result<()> {
        self.thread.set_stream(TransferStream::ServerRead, writer).await
    }

    /// The stream on which clients write resources
    pub async fn set_write_stream(&self, writer: Arc<dyn ChunkWriter>) -> anyhow::Result<()> {
        self.thread.set_stream(TransferStream::ServerWrite, writer).await
    }

    pub async fn process_read_chunk(&self, chunk: Bytes) -> anyhow::Result<()> {
        self.thread.process_chunk(TransferStream::ServerRead, chunk).await
    }

    pub async fn process_write_chunk(&self, chunk: Bytes) -> anyhow::Result<()> {
        self.thread.process_chunk(TransferStream::ServerWrite, chunk).await
    }

    /// Ends a server session on the resource's behalf, telling the client with a status chunk
    pub async fn end_transfer(&self, session_id: u32, status: Status) -> anyhow::Result<()> {
        self.thread.end_server_transfer(session_id, status, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, ChunkType, ProtocolVersion};
    use crate::config::TransferConfig;
    use crate::test_util::memory::MemoryResource;
    use crate::test_util::recording::RecordingChunkWriter;
    use crate::transfer_thread::TransferThread;
    use bytes::BytesMut;

    #[tokio::test(start_paused = true)]
    async fn test_end_transfer() {
        let (handle, thread) = TransferThread::new(TransferConfig::default()).unwrap();
        tokio::spawn(thread.run());
        let service = TransferService::new(handle);
        let (writer, mut sent) = RecordingChunkWriter::new();
        service.set_write_stream(Arc::new(writer)).await.unwrap();
        let resource = MemoryResource::new(vec![]);
        service.register_handler(Handler::write_only(12, resource.clone())).await.unwrap();

        let mut start = Chunk::new(ProtocolVersion::VersionTwo, ChunkType::Start, 77);
        start.desired_session_id = Some(77);
        start.resource_id = Some(12);
        let mut buf = BytesMut::new();
        start.encode(&mut buf, 256).unwrap();
        service.process_write_chunk(buf.freeze()).await.unwrap();
        assert_eq!(sent.next().await.chunk_type, ChunkType::StartAck);

        service.end_transfer(77, Status::PermissionDenied).await.unwrap();
        let completion = sent.next().await;
        assert_eq!(completion.session_id, 77);
        assert_eq!(completion.status, Some(Status::PermissionDenied));
        assert_eq!(resource.finalized(), vec![Status::PermissionDenied]);
    }
}
