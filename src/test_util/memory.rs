use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::handler::{ReadResource, TransferReader, TransferWriter, WriteResource};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::status::Status;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryReader {
    data: Vec<u8>,
    position: usize,
    seekable: bool,
}

impl MemoryReader {
    pub fn new(data: Vec<u8>) -> MemoryReader {
        MemoryReader { data, position: 0, seekable: true }
    }

    /// A reader that can only move forward, like a stream that is consumed as it is read
    pub fn non_seekable(data: Vec<u8>) -> MemoryReader {
        MemoryReader { data, position: 0, seekable: false }
    }
}

impl TransferReader for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        let remaining = &self.data[self.position..];
        let len = remaining.len().min(buf.len());
        buf[..len].copy_from_slice(&remaining[..len]);
        self.position += len;
        Ok(len)
    }

    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        if !self.seekable {
            return Err(Status::Unimplemented);
        }
        let len: u64 = self.data.len().safe_cast();
        if offset > len {
            return Err(Status::OutOfRange);
        }
        self.position = offset.prechecked_cast();
        Ok(())
    }
}

/// Appends to a shared buffer, so a clone kept by the test sees what the transfer wrote
#[derive(Clone, Default)]
pub struct MemoryWriter {
    data: Arc<Mutex<Vec<u8>>>,
    limit: Option<usize>,
}

impl MemoryWriter {
    pub fn new() -> MemoryWriter {
        MemoryWriter::default()
    }

    /// A writer that accepts at most `limit` bytes in total
    pub fn with_limit(limit: usize) -> MemoryWriter {
        MemoryWriter {
            data: Default::default(),
            limit: Some(limit),
        }
    }

    fn shared(data: Arc<Mutex<Vec<u8>>>) -> MemoryWriter {
        MemoryWriter { data, limit: None }
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }
}

impl TransferWriter for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), Status> {
        let mut buf = lock(&self.data);
        if let Some(limit) = self.limit {
            if buf.len() + data.len() > limit {
                return Err(Status::ResourceExhausted);
            }
        }
        buf.extend_from_slice(data);
        Ok(())
    }

    fn conservative_write_limit(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(lock(&self.data).len()),
            None => usize::MAX,
        }
    }
}

/// A resource backed by a byte buffer. Reads see a snapshot of the buffer, writes replace
///  its contents from the initial offset on. Clones share the buffer and the record of
///  finalization statuses.
#[derive(Clone)]
pub struct MemoryResource {
    data: Arc<Mutex<Vec<u8>>>,
    finalized: Arc<Mutex<Vec<Status>>>,
}

impl MemoryResource {
    pub fn new(data: Vec<u8>) -> MemoryResource {
        MemoryResource {
            data: Arc::new(Mutex::new(data)),
            finalized: Default::default(),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }

    /// The statuses of all finalized sessions, oldest first
    pub fn finalized(&self) -> Vec<Status> {
        lock(&self.finalized).clone()
    }
}

impl ReadResource for MemoryResource {
    fn prepare_read(&mut self, initial_offset: u64) -> Result<Box<dyn TransferReader>, Status> {
        let mut reader = MemoryReader::new(self.contents());
        reader.seek(initial_offset)?;
        Ok(Box::new(reader))
    }

    fn finalize_read(&mut self, status: Status) {
        lock(&self.finalized).push(status);
    }
}

impl WriteResource for MemoryResource {
    fn prepare_write(&mut self, initial_offset: u64) -> Result<Box<dyn TransferWriter>, Status> {
        let mut data = lock(&self.data);
        let len: u64 = data.len().safe_cast();
        if initial_offset > len {
            return Err(Status::OutOfRange);
        }
        data.truncate(initial_offset.prechecked_cast());
        Ok(Box::new(MemoryWriter::shared(self.data.clone())))
    }

    fn finalize_write(&mut self, status: Status) -> Result<(), Status> {
        lock(&self.finalized).push(status);
        Ok(())
    }
}
