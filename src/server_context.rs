use rustc_hash::FxHashMap;
use tracing::debug;

use crate::chunk::{Chunk, ChunkType};
use crate::context::{Context, DispatchEnv, TransferState, TransferType};
use crate::handler::{Handler, TransferIo};
use crate::status::Status;

/// Binds a new server session to the resource registered under `resource_id`
pub(crate) fn prepare_handler(handlers: &mut FxHashMap<u32, Handler>, resource_id: u32, transfer_type: TransferType, initial_offset: u64) -> Result<TransferIo, Status> {
    let Some(handler) = handlers.get_mut(&resource_id) else {
        debug!("no handler registered for resource {}", resource_id);
        return Err(Status::NotFound);
    };
    handler.prepare(transfer_type, initial_offset)
}

impl Context {
    /// `chunk` is the client's initial chunk, which for a legacy read carries the receiver's
    ///  window
    pub(crate) async fn start_server(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        if !self.is_legacy() {
            self.set_state(TransferState::Initiating);
            self.send_start_ack(env).await;
            return;
        }

        self.set_state(TransferState::Waiting);
        match self.transfer_type {
            TransferType::Receive => self.send_parameters(ChunkType::ParametersRetransmit, env).await,
            TransferType::Transmit => self.handle_parameters(chunk, true, env).await,
        }
    }

    pub(crate) async fn send_start_ack(&mut self, env: &mut DispatchEnv) {
        let mut chunk = self.new_chunk(ChunkType::StartAck);
        chunk.resource_id = Some(self.resource_id);
        chunk.initial_offset = self.initial_offset;

        self.set_timeout(self.chunk_timeout);
        let _ = self.send_chunk(chunk, env).await;
    }

    pub(crate) async fn handle_start_ack_confirmation(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        debug!("session {}: handshake confirmed", self.session_id);
        self.set_state(TransferState::Waiting);
        match self.transfer_type {
            TransferType::Receive => self.send_parameters(ChunkType::ParametersRetransmit, env).await,
            TransferType::Transmit => self.handle_parameters(chunk, true, env).await,
        }
    }

    pub(crate) fn finish_server(&mut self, status: Status, handlers: &mut FxHashMap<u32, Handler>) -> Status {
        match handlers.get_mut(&self.resource_id) {
            Some(handler) => handler.finalize(self.transfer_type, status),
            None => {
                debug!("handler for resource {} was removed - nothing to finalize", self.resource_id);
                status
            }
        }
    }
}
