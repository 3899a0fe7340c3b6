//! The dispatcher that owns all sessions. A single task processes events from a mailbox of
//!  depth one and fires session timeouts in between, so no session state is ever shared.
//!
//! Producers (the client and service facades, or the application's RPC glue) talk to it
//!  through a cloneable [TransferThreadHandle]. Each call waits until the dispatcher has taken
//!  the previous event out of the mailbox, which throttles inbound chunks to the speed of
//!  processing.

use std::cmp::min;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use anyhow::anyhow;
use bytes::Bytes;
use rand::Rng;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::chunk::{Chunk, ChunkType, ProtocolVersion};
use crate::client_context::CompletionCallback;
use crate::config::{TransferConfig, TransferOptions};
use crate::context::{Context, DispatchEnv, SessionParams, TransferSide, TransferState};
use crate::handler::{Handler, TransferIo};
use crate::server_context::prepare_handler;
use crate::status::Status;
use crate::stream::{ChunkWriter, TransferStream};

pub(crate) struct ClientTransferRequest {
    pub handle_id: u32,
    pub resource_id: u32,
    pub io: TransferIo,
    pub options: TransferOptions,
    pub on_completion: CompletionCallback,
}

pub(crate) enum Event {
    NewClientTransfer(ClientTransferRequest),
    Chunk {
        stream: TransferStream,
        chunk: Bytes,
    },
    EndClientTransfer {
        handle_id: u32,
        status: Status,
        send_status_chunk: bool,
    },
    EndServerTransfer {
        session_id: u32,
        status: Status,
        send_status_chunk: bool,
    },
    AddHandler(Handler),
    RemoveHandler(u32),
    SetStream {
        stream: TransferStream,
        writer: Option<Arc<dyn ChunkWriter>>,
    },
    Terminate,
}

#[derive(Clone)]
pub struct TransferThreadHandle {
    events: mpsc::Sender<Event>,
    next_session_id: Arc<AtomicU32>,
}

impl TransferThreadHandle {
    async fn send_event(&self, event: Event) -> anyhow::Result<()> {
        self.events.send(event).await
            .map_err(|_| anyhow!("the transfer thread has stopped"))
    }

    /// Session ids start at a random value so that sessions of a restarted client are unlikely
    ///  to collide with stale server sessions
    pub(crate) fn allocate_session_id(&self) -> u32 {
        loop {
            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Hands an inbound chunk to the transfer thread. Chunks on the `Client*` streams belong to
    ///  client sessions, chunks on the `Server*` streams to server sessions.
    pub async fn process_chunk(&self, stream: TransferStream, chunk: Bytes) -> anyhow::Result<()> {
        self.send_event(Event::Chunk { stream, chunk }).await
    }

    pub async fn set_stream(&self, stream: TransferStream, writer: Arc<dyn ChunkWriter>) -> anyhow::Result<()> {
        self.send_event(Event::SetStream { stream, writer: Some(writer) }).await
    }

    /// Closes the stream's writer with `Status::Ok`. Sessions using the stream fail on their
    ///  next send until a new writer is set.
    pub async fn clear_stream(&self, stream: TransferStream) -> anyhow::Result<()> {
        self.send_event(Event::SetStream { stream, writer: None }).await
    }

    pub async fn add_handler(&self, handler: Handler) -> anyhow::Result<()> {
        self.send_event(Event::AddHandler(handler)).await
    }

    /// Removes a resource handler, aborting the resource's active sessions
    pub async fn remove_handler(&self, resource_id: u32) -> anyhow::Result<()> {
        self.send_event(Event::RemoveHandler(resource_id)).await
    }

    pub(crate) async fn start_client_transfer(&self, request: ClientTransferRequest) -> anyhow::Result<()> {
        self.send_event(Event::NewClientTransfer(request)).await
    }

    pub(crate) async fn end_client_transfer(&self, handle_id: u32, status: Status, send_status_chunk: bool) -> anyhow::Result<()> {
        self.send_event(Event::EndClientTransfer { handle_id, status, send_status_chunk }).await
    }

    pub async fn end_server_transfer(&self, session_id: u32, status: Status, send_status_chunk: bool) -> anyhow::Result<()> {
        self.send_event(Event::EndServerTransfer { session_id, status, send_status_chunk }).await
    }

    /// Aborts all sessions without notifying peers, cancels all streams and stops the thread
    pub async fn terminate(&self) -> anyhow::Result<()> {
        self.send_event(Event::Terminate).await
    }
}

pub struct TransferThread {
    config: TransferConfig,
    events: mpsc::Receiver<Event>,
    client_contexts: Vec<Context>,
    server_contexts: Vec<Context>,
    env: DispatchEnv,
}

impl TransferThread {
    pub fn new(config: TransferConfig) -> anyhow::Result<(TransferThreadHandle, TransferThread)> {
        config.validate()?;

        let (send, recv) = mpsc::channel(1);
        let first_session_id = rand::thread_rng().gen_range(1..=u32::MAX / 2);

        let handle = TransferThreadHandle {
            events: send,
            next_session_id: Arc::new(AtomicU32::new(first_session_id)),
        };
        let thread = TransferThread {
            client_contexts: (0..config.max_client_transfers).map(|_| Context::new(&config)).collect(),
            server_contexts: (0..config.max_server_transfers).map(|_| Context::new(&config)).collect(),
            env: DispatchEnv::new(&config),
            events: recv,
            config,
        };
        Ok((handle, thread))
    }

    /// Runs the transfer thread on a dedicated OS thread with its own single-threaded runtime
    pub fn spawn_dedicated(self) -> anyhow::Result<std::thread::JoinHandle<()>> {
        let join_handle = std::thread::Builder::new()
            .name("transfer-thread".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("failed to create a runtime for the transfer thread: {}", e);
                        return;
                    }
                };
                rt.block_on(self.run());
            })?;
        Ok(join_handle)
    }

    pub async fn run(mut self) {
        info!("transfer thread started with {} client and {} server slots", self.client_contexts.len(), self.server_contexts.len());

        loop {
            let next_deadline = self.next_deadline();

            select! {
                evt = self.events.recv() => {
                    match evt {
                        Some(Event::Terminate) => {
                            self.terminate_all();
                            break;
                        }
                        Some(evt) => self.handle_event(evt).await,
                        None => {
                            info!("all handles were dropped - stopping the transfer thread");
                            break;
                        }
                    }
                }
                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {}
            }

            self.fire_expired_timeouts().await;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.client_contexts.iter()
            .chain(self.server_contexts.iter())
            .filter_map(|c| c.timeout())
            .min()
    }

    async fn fire_expired_timeouts(&mut self) {
        let now = Instant::now();
        for context in self.client_contexts.iter_mut().chain(self.server_contexts.iter_mut()) {
            if context.timeout().is_some_and(|t| t <= now) {
                context.handle_timeout(&mut self.env).await;
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::NewClientTransfer(request) => self.start_client_transfer(request).await,
            Event::Chunk { stream, chunk } => self.handle_chunk(stream, chunk).await,
            Event::EndClientTransfer { handle_id, status, send_status_chunk } => {
                match self.client_contexts.iter_mut().find(|c| c.is_active() && c.handle_id == handle_id) {
                    Some(context) => context.end_transfer(status, send_status_chunk, &mut self.env).await,
                    None => debug!("no active client transfer {} - ignoring end of transfer", handle_id),
                }
            }
            Event::EndServerTransfer { session_id, status, send_status_chunk } => {
                match self.server_contexts.iter_mut().find(|c| c.is_active() && c.session_id == session_id) {
                    Some(context) => context.end_transfer(status, send_status_chunk, &mut self.env).await,
                    None => debug!("no active server session {} - ignoring end of transfer", session_id),
                }
            }
            Event::AddHandler(handler) => {
                let resource_id = handler.resource_id();
                if self.env.handlers.insert(resource_id, handler).is_some() {
                    warn!("replacing the handler for resource {}", resource_id);
                }
                else {
                    debug!("registered handler for resource {}", resource_id);
                }
            }
            Event::RemoveHandler(resource_id) => self.remove_handler(resource_id).await,
            Event::SetStream { stream, writer } => {
                debug!("{} writer for stream {:?}", if writer.is_some() { "setting" } else { "clearing" }, stream);
                if let Some(previous) = self.env.streams.get(stream).cloned() {
                    previous.finish(Status::Ok).await;
                }
                self.env.streams.set(stream, writer);
            }
            Event::Terminate => self.terminate_all(),
        }
    }

    fn terminate_all(&mut self) {
        info!("terminating the transfer thread");
        for context in self.client_contexts.iter_mut().chain(self.server_contexts.iter_mut()) {
            if context.state() != TransferState::Inactive {
                context.abort(Status::Aborted, &mut self.env);
            }
        }
        self.env.streams.cancel_all();
    }

    async fn remove_handler(&mut self, resource_id: u32) {
        for context in self.server_contexts.iter_mut().filter(|c| c.is_active() && c.resource_id == resource_id) {
            info!("aborting session {} because the handler for resource {} is removed", context.session_id, resource_id);
            context.end_transfer(Status::Aborted, true, &mut self.env).await;
        }

        if self.env.handlers.remove(&resource_id).is_none() {
            debug!("no handler registered for resource {}", resource_id);
        }
    }

    async fn start_client_transfer(&mut self, request: ClientTransferRequest) {
        let ClientTransferRequest { handle_id, resource_id, io, options, on_completion } = request;

        let Some(slot) = free_slot(&self.client_contexts) else {
            warn!("no free slot for a client transfer of resource {} - rejecting", resource_id);
            on_completion(Status::ResourceExhausted);
            return;
        };

        let protocol_version = options.protocol_version
            .filter(|v| *v != ProtocolVersion::Unknown)
            .unwrap_or(self.config.default_protocol_version);
        let session_id = if protocol_version.is_legacy() { resource_id } else { handle_id };

        let params = SessionParams {
            side: TransferSide::Client,
            handle_id,
            session_id,
            resource_id,
            protocol_version: min(protocol_version, ProtocolVersion::LATEST),
            initial_offset: options.initial_offset,
            io,
            chunk_timeout: options.chunk_timeout.unwrap_or(self.config.chunk_timeout),
            initial_chunk_timeout: options.initial_chunk_timeout.unwrap_or(self.config.initial_chunk_timeout),
            on_completion: Some(on_completion),
        };

        let context = &mut self.client_contexts[slot];
        context.initialize(params, &self.config);
        context.start_client(&mut self.env).await;
    }

    async fn handle_chunk(&mut self, stream: TransferStream, raw: Bytes) {
        let chunk = match Chunk::decode(raw.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("dropping undecodable chunk for session {:?} on stream {:?}: {}", Chunk::peek_session_id(&raw), stream, e);
                return;
            }
        };
        trace!("received on {:?}: {:?}", stream, chunk);

        match stream.side() {
            TransferSide::Client => self.handle_client_chunk(stream, chunk).await,
            TransferSide::Server => self.handle_server_chunk(stream, chunk).await,
        }
    }

    async fn handle_client_chunk(&mut self, stream: TransferStream, chunk: Chunk) {
        let transfer_type = stream.transfer_type();

        let found = if chunk.is_legacy() {
            // a versioned session still waiting for START_ACK may be talking to a legacy
            //  server, which addresses it by resource id
            find_context(&self.client_contexts, |c| c.transfer_type == transfer_type && (
                (c.is_legacy() && c.session_id == chunk.session_id)
                    || (c.state() == TransferState::Initiating && c.resource_id == chunk.session_id)
            ))
        }
        else {
            find_context(&self.client_contexts, |c| c.transfer_type == transfer_type && !c.is_legacy() && c.session_id == chunk.session_id)
        };

        match found {
            Some(idx) => self.client_contexts[idx].handle_chunk(chunk, &mut self.env).await,
            None => {
                if chunk.chunk_type == ChunkType::Completion && !chunk.is_legacy() {
                    self.respond_without_session(stream, &chunk, ChunkType::CompletionAck, None).await;
                }
                else {
                    debug!("dropping {:?} chunk for unknown client session {}", chunk.chunk_type, chunk.session_id);
                }
            }
        }
    }

    async fn handle_server_chunk(&mut self, stream: TransferStream, chunk: Chunk) {
        if chunk.chunk_type == ChunkType::Start && !chunk.is_legacy() {
            self.handle_versioned_start(stream, chunk).await;
            return;
        }

        let transfer_type = stream.transfer_type();
        let found = find_context(&self.server_contexts, |c| c.transfer_type == transfer_type
            && c.session_id == chunk.session_id
            && c.is_legacy() == chunk.is_legacy());

        match found {
            Some(idx) => {
                let context = &mut self.server_contexts[idx];
                if chunk.is_legacy() && chunk.is_initial_chunk() && is_legacy_restart(context, &chunk) {
                    info!("legacy transfer {} was restarted by the client", chunk.session_id);
                    context.abort(Status::Aborted, &mut self.env);
                    self.start_server_transfer(stream, chunk).await;
                }
                else {
                    context.handle_chunk(chunk, &mut self.env).await;
                }
            }
            None if chunk.is_legacy() && chunk.is_initial_chunk() => self.start_server_transfer(stream, chunk).await,
            None => match chunk.chunk_type {
                ChunkType::Completion if !chunk.is_legacy() => self.respond_without_session(stream, &chunk, ChunkType::CompletionAck, None).await,
                ChunkType::Completion | ChunkType::CompletionAck => debug!("ignoring {:?} for unknown session {}", chunk.chunk_type, chunk.session_id),
                _ => {
                    debug!("{:?} chunk for unknown session {}", chunk.chunk_type, chunk.session_id);
                    self.respond_without_session(stream, &chunk, ChunkType::Completion, Some(Status::FailedPrecondition)).await;
                }
            }
        }
    }

    async fn handle_versioned_start(&mut self, stream: TransferStream, chunk: Chunk) {
        let transfer_type = stream.transfer_type();
        let session_id = chunk.desired_session_id.unwrap_or(chunk.session_id);

        let found = find_context(&self.server_contexts, |c| c.transfer_type == transfer_type && !c.is_legacy() && c.session_id == session_id);
        if let Some(idx) = found {
            let context = &mut self.server_contexts[idx];
            if context.state() == TransferState::Initiating && chunk.resource_id == Some(context.resource_id) {
                context.handle_chunk(chunk, &mut self.env).await;
                return;
            }
            if context.is_active() {
                info!("session {} is superseded by a new START", session_id);
            }
            context.abort(Status::Aborted, &mut self.env);
        }

        self.start_server_transfer(stream, chunk).await;
    }

    async fn start_server_transfer(&mut self, stream: TransferStream, chunk: Chunk) {
        let transfer_type = stream.transfer_type();

        let (session_id, resource_id, protocol_version) = if chunk.is_legacy() {
            (chunk.session_id, chunk.session_id, ProtocolVersion::Legacy)
        }
        else {
            let session_id = chunk.desired_session_id.unwrap_or(chunk.session_id);
            let Some(resource_id) = chunk.resource_id else {
                warn!("START for session {} has no resource id", session_id);
                self.reject_start(stream, &chunk, session_id, Status::InvalidArgument).await;
                return;
            };
            (session_id, resource_id, min(chunk.protocol_version, ProtocolVersion::LATEST))
        };

        let Some(slot) = free_slot(&self.server_contexts) else {
            warn!("no free slot for session {} on resource {} - rejecting", session_id, resource_id);
            self.reject_start(stream, &chunk, session_id, Status::ResourceExhausted).await;
            return;
        };

        let io = match prepare_handler(&mut self.env.handlers, resource_id, transfer_type, chunk.initial_offset) {
            Ok(io) => io,
            Err(status) => {
                self.reject_start(stream, &chunk, session_id, status).await;
                return;
            }
        };

        let params = SessionParams {
            side: TransferSide::Server,
            handle_id: session_id,
            session_id,
            resource_id,
            protocol_version,
            initial_offset: chunk.initial_offset,
            io,
            chunk_timeout: self.config.chunk_timeout,
            initial_chunk_timeout: self.config.initial_chunk_timeout,
            on_completion: None,
        };

        let context = &mut self.server_contexts[slot];
        context.initialize(params, &self.config);
        context.start_server(chunk, &mut self.env).await;
    }

    async fn reject_start(&mut self, stream: TransferStream, chunk: &Chunk, session_id: u32, status: Status) {
        debug!("rejecting session {} with {}", session_id, status);
        let mut response = Chunk::new(chunk.protocol_version, ChunkType::Completion, session_id);
        response.status = Some(status);
        if let Err(status) = self.env.write_chunk(&response, stream).await {
            debug!("failed to send rejection for session {}: {}", session_id, status);
        }
    }

    async fn respond_without_session(&mut self, stream: TransferStream, chunk: &Chunk, chunk_type: ChunkType, status: Option<Status>) {
        let mut response = Chunk::new(chunk.protocol_version, chunk_type, chunk.session_id);
        response.status = status;
        if let Err(status) = self.env.write_chunk(&response, stream).await {
            debug!("failed to respond to session {}: {}", chunk.session_id, status);
        }
    }
}

/// Prefers a slot that was never used or already released over a completed session that may
///  still have to answer late retransmissions
fn free_slot(contexts: &[Context]) -> Option<usize> {
    contexts.iter().position(|c| c.state() == TransferState::Inactive)
        .or_else(|| contexts.iter().position(Context::is_free))
}

/// Finds a context that is bound to a session, preferring unfinished sessions over completed
///  ones with the same id
fn find_context(contexts: &[Context], predicate: impl Fn(&Context) -> bool) -> Option<usize> {
    contexts.iter().position(|c| c.is_active() && predicate(c))
        .or_else(|| contexts.iter().position(|c| c.state() == TransferState::Completed && predicate(c)))
}

fn is_legacy_restart(context: &Context, chunk: &Chunk) -> bool {
    match context.state() {
        TransferState::Terminating | TransferState::Completed => true,
        _ => chunk.chunk_type == ChunkType::Start && context.has_progressed(),
    }
}
