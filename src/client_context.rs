use std::cmp::min;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkType, ProtocolVersion};
use crate::context::{Context, DispatchEnv, TransferState, TransferType};
use crate::status::Status;

/// Called exactly once with a client transfer's final status. It runs on the transfer thread,
///  so it must return quickly.
pub type CompletionCallback = Box<dyn FnOnce(Status) + Send>;

impl Context {
    pub(crate) async fn start_client(&mut self, env: &mut DispatchEnv) {
        if self.is_legacy() {
            if self.initial_offset != 0 {
                warn!("session {}: the legacy protocol cannot start at offset {}", self.session_id, self.initial_offset);
                self.abort(Status::Unimplemented, env);
                return;
            }
            self.set_state(TransferState::Waiting);
        }
        else {
            self.set_state(TransferState::Initiating);
        }
        self.send_start(env).await;
    }

    /// Sends the session's first chunk: a versioned START, or the legacy chunk that opens a
    ///  session implicitly. A receiver includes its window so that a legacy transmitter can
    ///  start right away.
    pub(crate) async fn send_start(&mut self, env: &mut DispatchEnv) {
        let mut chunk = self.new_chunk(ChunkType::Start);
        if !self.is_legacy() {
            chunk.protocol_version = self.desired_protocol_version;
            chunk.desired_session_id = Some(self.session_id);
            chunk.resource_id = Some(self.resource_id);
            chunk.initial_offset = self.initial_offset;
        }
        if self.transfer_type == TransferType::Receive {
            if let Err(status) = self.apply_window_parameters(&mut chunk) {
                self.abort(status, env);
                return;
            }
        }

        self.set_timeout(self.initial_chunk_timeout);
        let _ = self.send_chunk(chunk, env).await;
    }

    pub(crate) async fn handle_start_ack(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        if chunk.initial_offset != self.initial_offset {
            warn!("session {}: requested initial offset {}, but the server acknowledged {}", self.session_id, self.initial_offset, chunk.initial_offset);
            self.terminate(Status::Unimplemented, env).await;
            return;
        }

        self.configured_protocol_version = min(self.desired_protocol_version, chunk.protocol_version);
        debug!("session {}: handshake complete with {:?}", self.session_id, self.configured_protocol_version);

        self.set_state(TransferState::Waiting);
        self.send_start_ack_confirmation(env).await;
    }

    /// A peer that answers START with anything but a handshake chunk only speaks the legacy
    ///  protocol, which identifies the session by resource id
    pub(crate) async fn downgrade_to_legacy(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        info!("session {}: peer answered with a legacy {:?} chunk - falling back to the legacy protocol", self.session_id, chunk.chunk_type);
        self.configured_protocol_version = ProtocolVersion::Legacy;
        self.session_id = chunk.session_id;
        self.set_state(TransferState::Waiting);

        if chunk.chunk_type != ChunkType::Completion && self.initial_offset != 0 {
            warn!("session {}: the legacy protocol cannot resume at offset {}", self.session_id, self.initial_offset);
            self.terminate(Status::Unimplemented, env).await;
            return;
        }
        self.handle_steady_state_chunk(chunk, env).await;
    }

    pub(crate) fn finish_client(&mut self, status: Status) -> Status {
        if let Some(on_completion) = self.on_completion.take() {
            on_completion(status);
        }
        status
    }
}
