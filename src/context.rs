//! The per-session state machine shared by client and server sessions.
//!
//! ```ascii
//!                 START / START_ACK exchange (versioned only)
//!   Inactive ──> Initiating ───────────────────────────────> Waiting <──> Transmitting
//!      ^  \                                                    │  ^          (transmitter)
//!      │   \──────────────────── legacy ─────────────────────>│  │
//!      │                                                 gap  v  │ expected offset
//!      │                                                    Recovery     (receiver)
//!      │                                                       │
//!      │          COMPLETION_ACK / out of retries              v
//!      └──────── Completed <──────────────────────────── Terminating
//! ```
//!
//! All handlers run on the transfer thread. The dispatcher lends each handler a
//!  [DispatchEnv] with the shared encode buffer, the outbound streams and the handler registry.
//!
//! Every session finishes exactly once: [Context::finish] releases the resource, reports the
//!  status (completion callback or handler finalization) and records it, and later calls are
//!  no-ops. Sessions in `Completed` stay addressable until their slot is reused, so late
//!  retransmissions from the peer can still be answered.

use std::cmp::{max, min};
use std::time::Duration;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::chunk::{Chunk, ChunkType, ProtocolVersion, MAX_CHUNK_OVERHEAD};
use crate::client_context::CompletionCallback;
use crate::config::TransferConfig;
use crate::handler::{Handler, TransferIo};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::status::Status;
use crate::stream::{StreamSet, TransferStream};
use crate::transfer_rate::TransferRate;
use crate::window::ReceiveWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Transmit,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferSide {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// The slot is free
    Inactive,
    /// Versioned handshake in progress
    Initiating,
    /// Waiting for the peer: a receiver for data, a transmitter for parameters
    Waiting,
    /// A transmitter with an open window, sending a chunk whenever its timer fires
    Transmitting,
    /// A receiver that detected a gap and waits for the retransmission
    Recovery,
    /// Finished locally, waiting for the peer to acknowledge the COMPLETION chunk
    Terminating,
    /// Finished; the slot can be reused
    Completed,
}

/// The dispatcher's resources that a context needs while handling an event
pub(crate) struct DispatchEnv {
    pub encode_buf: BytesMut,
    pub read_buf: BytesMut,
    pub max_chunk_len: usize,
    pub streams: StreamSet,
    pub handlers: FxHashMap<u32, Handler>,
}

impl DispatchEnv {
    pub fn new(config: &TransferConfig) -> DispatchEnv {
        DispatchEnv {
            encode_buf: BytesMut::with_capacity(config.encode_buffer_size),
            read_buf: BytesMut::with_capacity(config.max_payload_len()),
            max_chunk_len: config.encode_buffer_size,
            streams: StreamSet::default(),
            handlers: FxHashMap::default(),
        }
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_chunk_len - MAX_CHUNK_OVERHEAD
    }

    /// Encodes a chunk into the shared buffer and passes it to the stream's writer
    pub async fn write_chunk(&mut self, chunk: &Chunk, stream: TransferStream) -> Result<(), Status> {
        trace!("sending on {:?}: {:?}", stream, chunk);

        self.encode_buf.clear();
        if let Err(e) = chunk.encode(&mut self.encode_buf, self.max_chunk_len) {
            warn!("encoding chunk for session {} failed: {}", chunk.session_id, e);
            return Err(Status::Internal);
        }

        let Some(writer) = self.streams.get(stream) else {
            warn!("no writer registered for stream {:?}", stream);
            return Err(Status::Internal);
        };
        if let Err(e) = writer.write(&self.encode_buf).await {
            warn!("writing to stream {:?} failed: {}", stream, e);
            return Err(Status::Internal);
        }
        Ok(())
    }
}

/// Everything needed to bind a free context to a new session
pub(crate) struct SessionParams {
    pub side: TransferSide,
    pub handle_id: u32,
    pub session_id: u32,
    pub resource_id: u32,
    pub protocol_version: ProtocolVersion,
    pub initial_offset: u64,
    pub io: TransferIo,
    pub chunk_timeout: Duration,
    pub initial_chunk_timeout: Duration,
    pub on_completion: Option<CompletionCallback>,
}

pub(crate) struct Context {
    pub(crate) side: TransferSide,
    pub(crate) transfer_type: TransferType,
    pub(crate) state: TransferState,
    pub(crate) handle_id: u32,
    pub(crate) session_id: u32,
    pub(crate) resource_id: u32,
    pub(crate) configured_protocol_version: ProtocolVersion,
    pub(crate) desired_protocol_version: ProtocolVersion,

    pub(crate) io: Option<TransferIo>,
    pub(crate) on_completion: Option<CompletionCallback>,

    pub(crate) offset: u64,
    pub(crate) initial_offset: u64,
    pub(crate) window_end_offset: u64,
    window: ReceiveWindow,
    /// for a receiver the advertised chunk size, for a transmitter the negotiated one
    max_chunk_size_bytes: u32,
    advertised_max_chunk_size_bytes: u32,
    min_delay: Duration,

    /// transmitter: start of the most recent data chunk; receiver in recovery: offset of the
    ///  most recent out-of-order chunk
    last_chunk_offset: u64,
    last_chunk_sent: Option<ChunkType>,
    end_of_data_sent: bool,

    retries: u32,
    lifetime_retries: u32,
    max_retries: u32,
    max_lifetime_retries: u32,
    pub(crate) chunk_timeout: Duration,
    pub(crate) initial_chunk_timeout: Duration,
    timeout: Option<Instant>,

    finished: bool,
    final_status: Option<Status>,
    transfer_rate: TransferRate,
}

impl Context {
    pub fn new(config: &TransferConfig) -> Context {
        Context {
            side: TransferSide::Client,
            transfer_type: TransferType::Receive,
            state: TransferState::Inactive,
            handle_id: 0,
            session_id: 0,
            resource_id: 0,
            configured_protocol_version: config.default_protocol_version,
            desired_protocol_version: config.default_protocol_version,
            io: None,
            on_completion: None,
            offset: 0,
            initial_offset: 0,
            window_end_offset: 0,
            window: ReceiveWindow::new(config.effective_max_chunk_size(), config.max_window_size_bytes, config.extend_window_divisor),
            max_chunk_size_bytes: config.effective_max_chunk_size(),
            advertised_max_chunk_size_bytes: config.effective_max_chunk_size(),
            min_delay: Duration::ZERO,
            last_chunk_offset: 0,
            last_chunk_sent: None,
            end_of_data_sent: false,
            retries: 0,
            lifetime_retries: 0,
            max_retries: config.max_retries,
            max_lifetime_retries: config.max_lifetime_retries,
            chunk_timeout: config.chunk_timeout,
            initial_chunk_timeout: config.initial_chunk_timeout,
            timeout: None,
            finished: true,
            final_status: None,
            transfer_rate: TransferRate::default(),
        }
    }

    pub fn initialize(&mut self, params: SessionParams, config: &TransferConfig) {
        let mut context = Context::new(config);
        context.side = params.side;
        context.transfer_type = params.io.transfer_type();
        context.handle_id = params.handle_id;
        context.session_id = params.session_id;
        context.resource_id = params.resource_id;
        context.configured_protocol_version = params.protocol_version;
        context.desired_protocol_version = params.protocol_version;
        context.io = Some(params.io);
        context.on_completion = params.on_completion;
        context.offset = params.initial_offset;
        context.initial_offset = params.initial_offset;
        context.window_end_offset = params.initial_offset;
        context.last_chunk_offset = params.initial_offset;
        context.chunk_timeout = params.chunk_timeout;
        context.initial_chunk_timeout = params.initial_chunk_timeout;
        context.finished = false;
        *self = context;

        debug!("initialized {:?} {:?} session {} for resource {} ({:?})", self.side, self.transfer_type, self.session_id, self.resource_id, self.configured_protocol_version);
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn timeout(&self) -> Option<Instant> {
        self.timeout
    }

    pub fn is_legacy(&self) -> bool {
        self.configured_protocol_version.is_legacy()
    }

    /// A session that has not finished yet
    pub fn is_active(&self) -> bool {
        !matches!(self.state, TransferState::Inactive | TransferState::Completed)
    }

    /// A slot that can be bound to a new session
    pub fn is_free(&self) -> bool {
        matches!(self.state, TransferState::Inactive | TransferState::Completed)
    }

    pub fn has_progressed(&self) -> bool {
        matches!(self.state, TransferState::Terminating | TransferState::Completed)
            || self.offset != self.initial_offset
    }

    pub(crate) fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            debug!("session {}: {:?} -> {:?}", self.session_id, self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn set_timeout(&mut self, delay: Duration) {
        self.timeout = Some(Instant::now() + delay);
    }

    pub(crate) fn new_chunk(&self, chunk_type: ChunkType) -> Chunk {
        Chunk::new(self.configured_protocol_version, chunk_type, self.session_id)
    }

    fn deactivate(&mut self) {
        self.set_state(TransferState::Inactive);
        self.timeout = None;
        self.io = None;
    }

    /// Sends a chunk on this session's stream. A transport failure is not retried: the session
    ///  finishes with `Internal` and is released, and `false` is returned.
    pub(crate) async fn send_chunk(&mut self, chunk: Chunk, env: &mut DispatchEnv) -> bool {
        let stream = TransferStream::for_transfer(self.side, self.transfer_type);
        if let Err(status) = env.write_chunk(&chunk, stream).await {
            error!("session {}: failed to send {:?} chunk - giving up with {}", self.session_id, chunk.chunk_type, status);
            self.finish(status, env);
            self.deactivate();
            return false;
        }
        self.last_chunk_sent = Some(chunk.chunk_type);
        true
    }

    /// Reports the session's final status. Only the first call has an effect; it returns the
    ///  effective status, which a server's resource finalization may have changed.
    pub(crate) fn finish(&mut self, status: Status, env: &mut DispatchEnv) -> Status {
        if self.finished {
            return self.final_status.unwrap_or(status);
        }
        self.finished = true;
        self.io = None;

        let status = match self.side {
            TransferSide::Client => self.finish_client(status),
            TransferSide::Server => self.finish_server(status, &mut env.handlers),
        };
        self.final_status = Some(status);

        info!("{:?} {:?} session {} for resource {} finished with {}: {} bytes at {:.0} bytes/s",
            self.side, self.transfer_type, self.session_id, self.resource_id, status,
            self.transfer_rate.total_bytes(), self.transfer_rate.bytes_per_second());
        status
    }

    /// Finishes the session and tells the peer. Versioned sessions then wait for the peer's
    ///  acknowledgement, legacy sessions are done.
    pub(crate) async fn terminate(&mut self, status: Status, env: &mut DispatchEnv) {
        let status = self.finish(status, env);

        let mut chunk = self.new_chunk(ChunkType::Completion);
        chunk.status = Some(status);
        self.set_timeout(self.chunk_timeout);
        if !self.send_chunk(chunk, env).await {
            return;
        }

        if self.is_legacy() {
            self.set_state(TransferState::Completed);
            self.timeout = None;
        }
        else {
            self.set_state(TransferState::Terminating);
            self.retries = 0;
        }
    }

    /// Finishes the session without telling the peer and frees the slot
    pub(crate) fn abort(&mut self, status: Status, env: &mut DispatchEnv) {
        self.finish(status, env);
        self.deactivate();
    }

    /// Ends a session on behalf of the application, optionally telling the peer
    pub(crate) async fn end_transfer(&mut self, status: Status, send_status_chunk: bool, env: &mut DispatchEnv) {
        if send_status_chunk && self.state != TransferState::Terminating {
            self.terminate(status, env).await;
        }
        else {
            self.abort(status, env);
        }
    }

    pub(crate) async fn handle_chunk(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        trace!("session {} in {:?}: handling {:?}", self.session_id, self.state, chunk);

        // any sign of life from the peer starts a new round of retries
        self.retries = 0;

        match self.state {
            TransferState::Inactive => debug!("session {} is inactive - dropping chunk", self.session_id),
            TransferState::Initiating => self.handle_chunk_initiating(chunk, env).await,
            TransferState::Waiting | TransferState::Transmitting | TransferState::Recovery => self.handle_steady_state_chunk(chunk, env).await,
            TransferState::Terminating => self.handle_chunk_terminating(chunk, env).await,
            TransferState::Completed => self.handle_chunk_completed(chunk, env).await,
        }
    }

    async fn handle_chunk_initiating(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        match (self.side, chunk.chunk_type) {
            (TransferSide::Client, ChunkType::Completion) if !chunk.is_legacy() => self.handle_completion(chunk, env).await,
            (TransferSide::Client, ChunkType::StartAck) => self.handle_start_ack(chunk, env).await,
            (TransferSide::Client, chunk_type) if !chunk_type.is_handshake() && chunk_type != ChunkType::CompletionAck => {
                self.downgrade_to_legacy(chunk, env).await;
            }
            (TransferSide::Server, ChunkType::Completion) => self.handle_completion(chunk, env).await,
            (TransferSide::Server, ChunkType::Start) => {
                debug!("session {}: START was retried - resending START_ACK", self.session_id);
                self.send_start_ack(env).await;
            }
            (TransferSide::Server, ChunkType::StartAckConfirmation) => self.handle_start_ack_confirmation(chunk, env).await,
            (TransferSide::Server, ChunkType::Data | ChunkType::ParametersRetransmit | ChunkType::ParametersContinue) => {
                debug!("session {}: {:?} before START_ACK_CONFIRMATION - treating the handshake as complete", self.session_id, chunk.chunk_type);
                self.set_state(TransferState::Waiting);
                self.handle_steady_state_chunk(chunk, env).await;
            }
            (_, chunk_type) => debug!("session {}: ignoring {:?} during handshake", self.session_id, chunk_type),
        }
    }

    pub(crate) async fn handle_steady_state_chunk(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        match chunk.chunk_type {
            ChunkType::Completion => self.handle_completion(chunk, env).await,
            ChunkType::CompletionAck => debug!("session {}: ignoring unexpected COMPLETION_ACK", self.session_id),
            _ => match self.transfer_type {
                TransferType::Transmit => self.handle_transmitter_chunk(chunk, env).await,
                TransferType::Receive => self.handle_receiver_chunk(chunk, env).await,
            }
        }
    }

    async fn handle_completion(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        let status = chunk.status.unwrap_or(Status::Unknown);
        debug!("session {}: peer completed the transfer with {}", self.session_id, status);
        self.finish(status, env);

        self.timeout = None;
        self.set_state(TransferState::Completed);
        if !chunk.is_legacy() {
            let ack = self.new_chunk(ChunkType::CompletionAck);
            let _ = self.send_chunk(ack, env).await;
        }
    }

    async fn handle_chunk_terminating(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        match chunk.chunk_type {
            ChunkType::CompletionAck => {
                self.timeout = None;
                self.set_state(TransferState::Completed);
            }
            ChunkType::Completion => {
                // both sides terminated concurrently
                self.timeout = None;
                self.set_state(TransferState::Completed);
                let ack = self.new_chunk(ChunkType::CompletionAck);
                let _ = self.send_chunk(ack, env).await;
            }
            _ => {
                debug!("session {}: {:?} while terminating - resending COMPLETION", self.session_id, chunk.chunk_type);
                self.send_completion(env).await;
            }
        }
    }

    async fn handle_chunk_completed(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        match chunk.chunk_type {
            ChunkType::Completion => {
                if !chunk.is_legacy() {
                    let ack = self.new_chunk(ChunkType::CompletionAck);
                    let _ = self.send_chunk(ack, env).await;
                }
            }
            ChunkType::CompletionAck => {}
            _ => {
                let mut response = self.new_chunk(ChunkType::Completion);
                if self.is_legacy() && self.transfer_type == TransferType::Receive {
                    // a legacy transmitter retransmits until it sees the final status
                    response.status = self.final_status;
                }
                else {
                    response.status = Some(Status::FailedPrecondition);
                }
                debug!("session {}: late {:?} chunk - answering with {:?}", self.session_id, chunk.chunk_type, response.status);
                let _ = self.send_chunk(response, env).await;
                self.timeout = None;
            }
        }
    }

    async fn send_completion(&mut self, env: &mut DispatchEnv) {
        let mut chunk = self.new_chunk(ChunkType::Completion);
        chunk.status = Some(self.final_status.unwrap_or(Status::Unknown));
        self.set_timeout(self.chunk_timeout);
        let _ = self.send_chunk(chunk, env).await;
    }

    async fn handle_receiver_chunk(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        match (self.side, chunk.chunk_type) {
            (_, ChunkType::Data) => self.handle_data(chunk, env).await,
            (TransferSide::Client, ChunkType::StartAck) => {
                debug!("session {}: START_ACK was retried - resending the confirmation", self.session_id);
                self.send_start_ack_confirmation(env).await;
            }
            (TransferSide::Server, ChunkType::StartAckConfirmation) => {
                self.send_parameters(ChunkType::ParametersRetransmit, env).await;
            }
            (TransferSide::Server, ChunkType::Start) if chunk.is_legacy() && self.offset == self.initial_offset => {
                self.send_parameters(ChunkType::ParametersRetransmit, env).await;
            }
            (_, chunk_type) => debug!("session {}: receiver ignores {:?}", self.session_id, chunk_type),
        }
    }

    async fn handle_data(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        if self.state == TransferState::Recovery {
            if chunk.offset == self.offset {
                debug!("session {}: received expected offset {} - recovered", self.session_id, self.offset);
                self.set_state(TransferState::Waiting);
            }
            else if chunk.offset == self.last_chunk_offset {
                // the transmitter retried its last chunk, so our parameters got lost
                debug!("session {}: transmitter retried offset {} - resending parameters", self.session_id, chunk.offset);
                self.send_parameters(ChunkType::ParametersRetransmit, env).await;
                return;
            }
            else {
                trace!("session {}: dropping chunk at offset {} while waiting for {}", self.session_id, chunk.offset, self.offset);
                self.last_chunk_offset = chunk.offset;
                return;
            }
        }

        let chunk_len: u64 = chunk.data.len().safe_cast();
        if chunk.offset != self.offset {
            if chunk.offset < self.offset && chunk.offset + chunk_len <= self.offset {
                debug!("session {}: duplicate chunk at offset {} (expected {})", self.session_id, chunk.offset, self.offset);
                self.send_parameters(ChunkType::ParametersContinue, env).await;
                return;
            }

            debug!("session {}: expected offset {}, received {} - requesting retransmission", self.session_id, self.offset, chunk.offset);
            self.window.on_loss();
            self.last_chunk_offset = chunk.offset;
            self.set_state(TransferState::Recovery);
            self.send_parameters(ChunkType::ParametersRetransmit, env).await;
            return;
        }

        if chunk.offset + chunk_len > self.window_end_offset {
            warn!("session {}: chunk at offset {} with {} bytes exceeds the window end at {}", self.session_id, chunk.offset, chunk_len, self.window_end_offset);
            self.terminate(Status::Internal, env).await;
            return;
        }

        if !chunk.data.is_empty() {
            let Some(TransferIo::Writer(writer)) = &mut self.io else {
                self.terminate(Status::Internal, env).await;
                return;
            };
            if let Err(status) = writer.write(&chunk.data) {
                warn!("session {}: writing {} bytes at offset {} failed: {}", self.session_id, chunk_len, chunk.offset, status);
                self.terminate(Status::DataLoss, env).await;
                return;
            }
        }
        self.offset += chunk_len;
        self.transfer_rate.on_bytes(chunk_len, Instant::now());

        if chunk.is_final_data() {
            debug!("session {}: received final chunk at offset {}", self.session_id, self.offset);
            self.terminate(Status::Ok, env).await;
            return;
        }

        let remaining_in_window = self.window_end_offset.saturating_sub(self.offset);
        if remaining_in_window == 0 || self.window.should_extend(remaining_in_window) {
            self.window.on_window_extended();
            self.send_parameters(ChunkType::ParametersContinue, env).await;
        }
        else {
            self.set_timeout(self.chunk_timeout);
        }
    }

    /// Recomputes the receive window starting at the current offset and writes it into `chunk`
    pub(crate) fn apply_window_parameters(&mut self, chunk: &mut Chunk) -> Result<(), Status> {
        let write_limit = match &self.io {
            Some(TransferIo::Writer(writer)) => writer.conservative_write_limit(),
            _ => return Err(Status::Internal),
        };
        if write_limit == 0 {
            warn!("session {}: writer has no capacity left", self.session_id);
            return Err(Status::ResourceExhausted);
        }

        let window_size = min(self.window.window_size(), write_limit.safe_cast());
        self.window_end_offset = self.offset + window_size;

        chunk.offset = self.offset;
        chunk.window_end_offset = Some(self.window_end_offset);
        chunk.max_chunk_size_bytes = Some(self.advertised_max_chunk_size_bytes);
        Ok(())
    }

    pub(crate) async fn send_parameters(&mut self, chunk_type: ChunkType, env: &mut DispatchEnv) {
        let mut chunk = self.new_chunk(chunk_type);
        if let Err(status) = self.apply_window_parameters(&mut chunk) {
            self.terminate(status, env).await;
            return;
        }
        debug!("session {}: sending {:?} for offset {}, window end {}", self.session_id, chunk_type, self.offset, self.window_end_offset);

        self.set_timeout(self.chunk_timeout);
        let _ = self.send_chunk(chunk, env).await;
    }

    async fn handle_transmitter_chunk(&mut self, chunk: Chunk, env: &mut DispatchEnv) {
        match (self.side, chunk.chunk_type) {
            (_, ChunkType::ParametersRetransmit | ChunkType::Start | ChunkType::StartAckConfirmation) => self.handle_parameters(chunk, true, env).await,
            (_, ChunkType::ParametersContinue) => self.handle_parameters(chunk, false, env).await,
            (TransferSide::Client, ChunkType::StartAck) => {
                debug!("session {}: START_ACK was retried - resending the confirmation", self.session_id);
                self.send_start_ack_confirmation(env).await;
            }
            (_, chunk_type) => debug!("session {}: transmitter ignores {:?}", self.session_id, chunk_type),
        }
    }

    pub(crate) async fn handle_parameters(&mut self, chunk: Chunk, retransmit: bool, env: &mut DispatchEnv) {
        let Some(window_end_offset) = chunk.window_end_offset else {
            if chunk.chunk_type == ChunkType::StartAckConfirmation {
                // the receiver's parameters follow separately
                self.set_state(TransferState::Waiting);
                self.set_timeout(self.chunk_timeout);
                return;
            }
            warn!("session {}: {:?} chunk without window", self.session_id, chunk.chunk_type);
            self.terminate(Status::InvalidArgument, env).await;
            return;
        };
        if window_end_offset < chunk.offset {
            warn!("session {}: window end {} is before offset {}", self.session_id, window_end_offset, chunk.offset);
            self.terminate(Status::Internal, env).await;
            return;
        }

        if retransmit {
            if chunk.offset != self.offset {
                if let Err(status) = self.seek_reader(chunk.offset) {
                    self.terminate(status, env).await;
                    return;
                }
                debug!("session {}: retransmitting from offset {} (was at {})", self.session_id, chunk.offset, self.offset);
                self.offset = chunk.offset;
            }
            self.window_end_offset = window_end_offset;
            self.end_of_data_sent = false;
        }
        else {
            if self.end_of_data_sent {
                trace!("session {}: window extension after the final chunk - ignoring", self.session_id);
                return;
            }
            self.window_end_offset = max(self.window_end_offset, window_end_offset);
        }

        if let Some(max_chunk_size_bytes) = chunk.max_chunk_size_bytes {
            if max_chunk_size_bytes == 0 {
                warn!("session {}: peer requested a max chunk size of 0", self.session_id);
                self.terminate(Status::InvalidArgument, env).await;
                return;
            }
            let payload_limit: u64 = env.max_payload_len().safe_cast();
            self.max_chunk_size_bytes = min(max_chunk_size_bytes.safe_cast(), payload_limit) as u32;
        }
        if let Some(min_delay_microseconds) = chunk.min_delay_microseconds {
            self.min_delay = Duration::from_micros(min_delay_microseconds.safe_cast());
        }

        self.set_state(TransferState::Transmitting);
        self.timeout = Some(Instant::now());
    }

    fn seek_reader(&mut self, offset: u64) -> Result<(), Status> {
        let Some(TransferIo::Reader(reader)) = &mut self.io else {
            return Err(Status::Internal);
        };
        reader.seek(offset).map_err(|status| {
            warn!("session {}: seeking to offset {} failed: {}", self.session_id, offset, status);
            match status {
                Status::Unimplemented => Status::Unimplemented,
                Status::OutOfRange | Status::InvalidArgument => Status::Internal,
                _ => Status::DataLoss,
            }
        })
    }

    async fn transmit_next_chunk(&mut self, env: &mut DispatchEnv) {
        let remaining_in_window = self.window_end_offset.saturating_sub(self.offset);
        if remaining_in_window == 0 {
            debug!("session {}: window exhausted at offset {}", self.session_id, self.offset);
            self.set_state(TransferState::Waiting);
            self.set_timeout(self.chunk_timeout);
            return;
        }

        let max_len: u64 = min(min(self.max_chunk_size_bytes.safe_cast(), env.max_payload_len().safe_cast()), remaining_in_window);
        let max_len: usize = max_len.prechecked_cast();

        let Some(TransferIo::Reader(reader)) = &mut self.io else {
            self.terminate(Status::Internal, env).await;
            return;
        };
        env.read_buf.clear();
        env.read_buf.resize(max_len, 0);
        let num_read = match reader.read(&mut env.read_buf[..]) {
            Ok(n) => min(n, max_len),
            Err(status) => {
                warn!("session {}: reading at offset {} failed: {}", self.session_id, self.offset, status);
                self.terminate(Status::DataLoss, env).await;
                return;
            }
        };
        let end_of_data = num_read < max_len;

        let mut chunk = self.new_chunk(ChunkType::Data);
        chunk.offset = self.offset;
        chunk.data = env.read_buf.split_to(num_read).freeze();
        if end_of_data {
            chunk.remaining_bytes = Some(0);
        }

        self.last_chunk_offset = self.offset;
        if !self.send_chunk(chunk, env).await {
            return;
        }

        let num_read: u64 = num_read.safe_cast();
        self.offset += num_read;
        self.transfer_rate.on_bytes(num_read, Instant::now());

        if end_of_data {
            debug!("session {}: sent final chunk, {} bytes in total", self.session_id, self.offset);
            self.end_of_data_sent = true;
            self.set_state(TransferState::Waiting);
            self.set_timeout(self.chunk_timeout);
        }
        else if self.offset >= self.window_end_offset {
            self.set_state(TransferState::Waiting);
            self.set_timeout(self.chunk_timeout);
        }
        else {
            self.set_timeout(self.min_delay);
        }
    }

    pub(crate) async fn handle_timeout(&mut self, env: &mut DispatchEnv) {
        self.timeout = None;

        match self.state {
            TransferState::Inactive | TransferState::Completed => {}
            TransferState::Transmitting => self.transmit_next_chunk(env).await,
            TransferState::Initiating | TransferState::Waiting | TransferState::Recovery | TransferState::Terminating => {
                if self.retries >= self.max_retries || self.lifetime_retries >= self.max_lifetime_retries {
                    self.give_up(env).await;
                    return;
                }
                self.retries += 1;
                self.lifetime_retries += 1;
                debug!("session {}: timeout in {:?} - retry {} of {}", self.session_id, self.state, self.retries, self.max_retries);
                self.retry(env).await;
            }
        }
    }

    async fn give_up(&mut self, env: &mut DispatchEnv) {
        if self.state == TransferState::Terminating {
            warn!("session {}: COMPLETION was never acknowledged", self.session_id);
            self.deactivate();
            return;
        }

        warn!("session {}: peer unresponsive after {} retries ({} in total)", self.session_id, self.retries, self.lifetime_retries);
        let status = self.finish(Status::DeadlineExceeded, env);

        // best effort - the peer may be gone
        let mut chunk = self.new_chunk(ChunkType::Completion);
        chunk.status = Some(status);
        if self.send_chunk(chunk, env).await {
            self.deactivate();
        }
    }

    async fn retry(&mut self, env: &mut DispatchEnv) {
        match self.state {
            TransferState::Initiating => match self.side {
                TransferSide::Client => self.send_start(env).await,
                TransferSide::Server => self.send_start_ack(env).await,
            },
            TransferState::Terminating => self.send_completion(env).await,
            _ => match (self.last_chunk_sent, self.transfer_type) {
                (Some(ChunkType::Start), _) => self.send_start(env).await,
                (Some(ChunkType::StartAck), _) => self.send_start_ack(env).await,
                (Some(ChunkType::StartAckConfirmation), _) => self.send_start_ack_confirmation(env).await,
                (_, TransferType::Receive) => {
                    // nothing arrived within the timeout, so the outstanding window was lost
                    self.window.on_loss();
                    self.send_parameters(ChunkType::ParametersRetransmit, env).await;
                }
                (Some(ChunkType::Data), TransferType::Transmit) => self.retransmit_last_chunk(env).await,
                (_, TransferType::Transmit) => self.set_timeout(self.chunk_timeout),
            }
        }
    }

    async fn retransmit_last_chunk(&mut self, env: &mut DispatchEnv) {
        let offset = self.last_chunk_offset;
        if let Err(status) = self.seek_reader(offset) {
            warn!("session {}: cannot rewind to offset {} to retry ({}) - giving up", self.session_id, offset, status);
            self.terminate(Status::DeadlineExceeded, env).await;
            return;
        }
        debug!("session {}: resending chunk at offset {}", self.session_id, offset);

        self.offset = offset;
        self.end_of_data_sent = false;
        self.transmit_next_chunk(env).await;
    }

    pub(crate) async fn send_start_ack_confirmation(&mut self, env: &mut DispatchEnv) {
        let mut chunk = self.new_chunk(ChunkType::StartAckConfirmation);
        if self.transfer_type == TransferType::Receive {
            if let Err(status) = self.apply_window_parameters(&mut chunk) {
                self.terminate(status, env).await;
                return;
            }
        }
        self.set_timeout(self.chunk_timeout);
        let _ = self.send_chunk(chunk, env).await;
    }
}
