//! A windowed, resumable transfer protocol for moving resources of arbitrary size between a
//!  client and a server over bidirectional RPC streams.
//!
//! ## Design goals
//!
//! * A transfer moves the bytes of one *resource*, identified by a numeric resource id, in
//!   either direction: a client *read* pulls from the server, a client *write* pushes to it
//!   * the side that holds the data is the *transmitter*, the other side the *receiver*
//! * The receiver controls the flow: it announces a window (`window_end_offset`) and a maximum
//!   chunk size, and the transmitter never sends beyond the window
//!   * the window grows exponentially at first and linearly after the first loss, and shrinks
//!     on loss (TCP style slow start / congestion avoidance)
//! * The transport may drop chunks. The receiver detects gaps by offset and asks for a
//!   retransmission from the first missing byte, the transmitter rewinds its reader.
//! * Both sides retry on timeout, bounded per exchange and over the session's lifetime
//! * A session ends exactly once: the side that finishes sends COMPLETION with the final
//!   status, and the peer acknowledges it
//! * Transfers can resume at a non-zero `initial_offset`
//! * Peers that only speak the legacy protocol (no handshake, sessions identified by resource
//!   id) interoperate transparently
//!
//! ## Streams
//!
//! Chunks travel on four RPC streams, named from the client's perspective:
//!
//! ```ascii
//!   client                             server
//!   ClientRead   <── DATA ───────────  ServerRead
//!                ─── PARAMETERS ──>
//!   ClientWrite  ─── DATA ──────────>  ServerWrite
//!                <── PARAMETERS ───
//! ```
//!
//! The application provides a [stream::ChunkWriter] for each outbound half and hands inbound
//!  chunks to [client::TransferClient] or [service::TransferService].
//!
//! ## Versioned handshake
//!
//! ```ascii
//!   client                                       server
//!   START (desired_session_id, resource_id)  ──>
//!                                            <──  START_ACK (session_id, protocol_version)
//!   START_ACK_CONFIRMATION                   ──>
//!   ... DATA / PARAMETERS_RETRANSMIT / PARAMETERS_CONTINUE ...
//!   COMPLETION (status)                      ──>  (sent by whichever side finishes)
//!                                            <──  COMPLETION_ACK
//! ```
//!
//! A client that gets anything but START_ACK in response to START assumes a legacy server and
//!  continues with the legacy protocol.
//!
//! ## Threading
//!
//! All sessions live on a single [transfer_thread::TransferThread], which owns a fixed number
//!  of client and server session slots. Handles to it are cheap to clone and can be used from
//!  any task or thread.

pub mod chunk;
pub mod client;
mod client_context;
pub mod config;
mod context;
pub mod handler;
pub mod safe_converter;
mod server_context;
pub mod service;
pub mod status;
pub mod stream;
pub mod test_util;
pub mod transfer_rate;
pub mod transfer_thread;
pub mod window;

pub use client::{TransferClient, TransferHandle};
pub use client_context::CompletionCallback;
pub use config::{TransferConfig, TransferOptions};
pub use context::{TransferSide, TransferState, TransferType};
pub use handler::Handler;
pub use service::TransferService;
pub use status::Status;
pub use stream::{ChunkWriter, TransferStream};
pub use transfer_thread::{TransferThread, TransferThreadHandle};


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}
