//! The resource side of a transfer: readers and writers that produce and consume a session's
//!  bytes, and the handlers through which a server makes resources available by id.
//!
//! Reader and writer calls are synchronous and happen on the transfer thread, so they must
//!  not block for long.

use tracing::{debug, warn};

use crate::context::TransferType;
use crate::status::Status;

pub trait TransferReader: Send {
    /// Fills `buf` and returns the number of bytes read. Returning less than `buf.len()` means
    ///  that the end of the data is reached.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status>;

    /// Positions the reader at an absolute offset, for retransmissions and resumed transfers
    fn seek(&mut self, _offset: u64) -> Result<(), Status> {
        Err(Status::Unimplemented)
    }
}

pub trait TransferWriter: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), Status>;

    /// The number of bytes the writer can currently accept without failing. The receive
    ///  window is never bigger than this, and a limit of 0 ends the transfer with
    ///  `ResourceExhausted`.
    fn conservative_write_limit(&self) -> usize {
        usize::MAX
    }
}

/// The I/O endpoint bound to a session: transmitters read, receivers write
pub enum TransferIo {
    Reader(Box<dyn TransferReader>),
    Writer(Box<dyn TransferWriter>),
}

impl TransferIo {
    pub fn transfer_type(&self) -> TransferType {
        match self {
            TransferIo::Reader(_) => TransferType::Transmit,
            TransferIo::Writer(_) => TransferType::Receive,
        }
    }
}

/// A resource that clients can read from
pub trait ReadResource: Send {
    /// Called when a client starts reading, returning the reader for the session. Resuming
    ///  at a non-zero `initial_offset` requires a reader that is positioned accordingly.
    fn prepare_read(&mut self, initial_offset: u64) -> Result<Box<dyn TransferReader>, Status>;

    /// Called exactly once when a read session ends, after its reader was dropped
    fn finalize_read(&mut self, _status: Status) {}
}

/// A resource that clients can write to
pub trait WriteResource: Send {
    fn prepare_write(&mut self, initial_offset: u64) -> Result<Box<dyn TransferWriter>, Status>;

    /// Called exactly once when a write session ends, after its writer was dropped. Failing
    ///  here turns a successful transfer into `DataLoss`.
    fn finalize_write(&mut self, _status: Status) -> Result<(), Status> {
        Ok(())
    }
}

pub trait ReadWriteResource: ReadResource + WriteResource {}
impl<T: ReadResource + WriteResource> ReadWriteResource for T {}

enum HandlerKind {
    ReadOnly(Box<dyn ReadResource>),
    WriteOnly(Box<dyn WriteResource>),
    ReadWrite(Box<dyn ReadWriteResource>),
}

/// A resource registered with a server under a resource id
pub struct Handler {
    resource_id: u32,
    kind: HandlerKind,
}

impl Handler {
    pub fn read_only(resource_id: u32, resource: impl ReadResource + 'static) -> Handler {
        Handler { resource_id, kind: HandlerKind::ReadOnly(Box::new(resource)) }
    }

    pub fn write_only(resource_id: u32, resource: impl WriteResource + 'static) -> Handler {
        Handler { resource_id, kind: HandlerKind::WriteOnly(Box::new(resource)) }
    }

    pub fn read_write(resource_id: u32, resource: impl ReadWriteResource + 'static) -> Handler {
        Handler { resource_id, kind: HandlerKind::ReadWrite(Box::new(resource)) }
    }

    pub fn resource_id(&self) -> u32 {
        self.resource_id
    }

    /// `transfer_type` is the server's role: a client read is served by a transmitting session
    pub(crate) fn prepare(&mut self, transfer_type: TransferType, initial_offset: u64) -> Result<TransferIo, Status> {
        let result = match (&mut self.kind, transfer_type) {
            (HandlerKind::ReadOnly(r), TransferType::Transmit) => r.prepare_read(initial_offset).map(TransferIo::Reader),
            (HandlerKind::ReadWrite(r), TransferType::Transmit) => r.prepare_read(initial_offset).map(TransferIo::Reader),
            (HandlerKind::WriteOnly(w), TransferType::Receive) => w.prepare_write(initial_offset).map(TransferIo::Writer),
            (HandlerKind::ReadWrite(w), TransferType::Receive) => w.prepare_write(initial_offset).map(TransferIo::Writer),
            _ => {
                debug!("resource {} does not support {:?}", self.resource_id, transfer_type);
                return Err(Status::PermissionDenied);
            }
        };

        result.map_err(|status| {
            warn!("preparing resource {} for {:?} failed: {}", self.resource_id, transfer_type, status);
            match status {
                Status::PermissionDenied | Status::Unimplemented | Status::ResourceExhausted | Status::Unavailable => status,
                _ => Status::DataLoss,
            }
        })
    }

    pub(crate) fn finalize(&mut self, transfer_type: TransferType, status: Status) -> Status {
        match (&mut self.kind, transfer_type) {
            (HandlerKind::ReadOnly(r), TransferType::Transmit) => r.finalize_read(status),
            (HandlerKind::ReadWrite(r), TransferType::Transmit) => r.finalize_read(status),
            (HandlerKind::WriteOnly(w), TransferType::Receive) => return finalize_write(w.as_mut(), self.resource_id, status),
            (HandlerKind::ReadWrite(w), TransferType::Receive) => return finalize_write(w.as_mut(), self.resource_id, status),
            _ => {}
        }
        status
    }
}

fn finalize_write<W: WriteResource + ?Sized>(resource: &mut W, resource_id: u32, status: Status) -> Status {
    match resource.finalize_write(status) {
        Ok(()) => status,
        Err(e) if status.is_ok() => {
            warn!("finalizing resource {} after a successful write failed: {}", resource_id, e);
            Status::DataLoss
        }
        Err(_) => status,
    }
}
