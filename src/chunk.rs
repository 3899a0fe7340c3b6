//! Wire codec for transfer chunks.
//!
//! A chunk is a protobuf-compatible message: a sequence of fields, each introduced by a varint
//!  key `(field_number << 3) | wire_type`. Only varint (0) and length-delimited (2) fields are
//!  written, but fixed 32 and 64 bit fields from newer peers are skipped when decoding.
//!
//! ```ascii
//!  1  transfer_id             varint   legacy session id; resource id in a versioned START
//!  2  pending_bytes           varint   legacy window size (window_end_offset - offset)
//!  3  max_chunk_size_bytes    varint
//!  4  min_delay_microseconds  varint
//!  5  offset                  varint
//!  6  data                    bytes
//!  7  remaining_bytes         varint   0 marks the final data chunk
//!  8  status                  varint   present in terminal chunks only
//!  9  window_end_offset       varint
//! 10  type                    varint   see ChunkType
//! 11  resource_id             varint   handshake chunks only
//! 12  session_id              varint
//! 13  protocol_version        varint   handshake chunks only
//! 14  desired_session_id      varint   START only
//! 15  initial_offset          varint   START / START_ACK only
//! ```
//!
//! Legacy peers do not write `session_id`, `protocol_version` and sometimes not even `type`.
//!  Decoding infers the missing values so that the state machine only ever sees complete chunks.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::safe_converter::{SafeCast, SaturatingCast};
use crate::status::Status;

/// Upper bound for the non-payload part of an encoded DATA chunk. The payload of a chunk is
///  limited to the encode buffer size minus this overhead.
pub const MAX_CHUNK_OVERHEAD: usize = 64;

const WIRE_TYPE_VARINT: u64 = 0;
const WIRE_TYPE_FIXED64: u64 = 1;
const WIRE_TYPE_LEN: u64 = 2;
const WIRE_TYPE_FIXED32: u64 = 5;

const FIELD_TRANSFER_ID: u64 = 1;
const FIELD_PENDING_BYTES: u64 = 2;
const FIELD_MAX_CHUNK_SIZE_BYTES: u64 = 3;
const FIELD_MIN_DELAY_MICROSECONDS: u64 = 4;
const FIELD_OFFSET: u64 = 5;
const FIELD_DATA: u64 = 6;
const FIELD_REMAINING_BYTES: u64 = 7;
const FIELD_STATUS: u64 = 8;
const FIELD_WINDOW_END_OFFSET: u64 = 9;
const FIELD_TYPE: u64 = 10;
const FIELD_RESOURCE_ID: u64 = 11;
const FIELD_SESSION_ID: u64 = 12;
const FIELD_PROTOCOL_VERSION: u64 = 13;
const FIELD_DESIRED_SESSION_ID: u64 = 14;
const FIELD_INITIAL_OFFSET: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ChunkType {
    Data = 0,
    Start = 1,
    /// Receiver's window parameters; the transmitter must rewind to `offset`
    ParametersRetransmit = 2,
    /// Receiver's window extension; the transmitter keeps its position
    ParametersContinue = 3,
    Completion = 4,
    CompletionAck = 5,
    StartAck = 6,
    StartAckConfirmation = 7,
}

impl ChunkType {
    pub fn is_handshake(&self) -> bool {
        matches!(self, ChunkType::Start | ChunkType::StartAck | ChunkType::StartAckConfirmation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ProtocolVersion {
    Unknown = 0,
    /// No handshake, the resource id doubles as session id
    Legacy = 1,
    /// Three-way START handshake, explicit sessions, completion acknowledgement
    VersionTwo = 2,
}

impl ProtocolVersion {
    pub const LATEST: ProtocolVersion = ProtocolVersion::VersionTwo;

    /// Versions newer than this implementation understands are treated as the latest one, since
    ///  negotiation picks the minimum of both sides' versions anyway.
    pub fn from_wire(raw: u32) -> ProtocolVersion {
        ProtocolVersion::try_from(raw).unwrap_or(ProtocolVersion::LATEST)
    }

    pub fn is_legacy(&self) -> bool {
        *self < ProtocolVersion::VersionTwo
    }
}

/// A decoded chunk. For legacy chunks, `session_id` holds the transfer id (i.e. the resource id),
///  and `window_end_offset` is derived from `pending_bytes` if the peer did not send it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub protocol_version: ProtocolVersion,
    pub chunk_type: ChunkType,
    pub session_id: u32,
    pub desired_session_id: Option<u32>,
    pub resource_id: Option<u32>,
    pub offset: u64,
    pub window_end_offset: Option<u64>,
    pub max_chunk_size_bytes: Option<u32>,
    pub min_delay_microseconds: Option<u32>,
    pub data: Bytes,
    pub remaining_bytes: Option<u64>,
    pub status: Option<Status>,
    pub initial_offset: u64,
}

impl Chunk {
    pub fn new(protocol_version: ProtocolVersion, chunk_type: ChunkType, session_id: u32) -> Chunk {
        Chunk {
            protocol_version,
            chunk_type,
            session_id,
            desired_session_id: None,
            resource_id: None,
            offset: 0,
            window_end_offset: None,
            max_chunk_size_bytes: None,
            min_delay_microseconds: None,
            data: Bytes::new(),
            remaining_bytes: None,
            status: None,
            initial_offset: 0,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.protocol_version.is_legacy()
    }

    /// Is this a chunk that opens a new session? Legacy peers have no dedicated START chunk, so
    ///  a parameters or empty data chunk at offset 0 counts as well.
    pub fn is_initial_chunk(&self) -> bool {
        if !self.is_legacy() {
            return self.chunk_type == ChunkType::Start;
        }

        match self.chunk_type {
            ChunkType::Start => true,
            ChunkType::ParametersRetransmit => self.offset == 0,
            ChunkType::Data => self.offset == 0 && self.data.is_empty() && self.remaining_bytes.is_none(),
            _ => false,
        }
    }

    pub fn is_final_data(&self) -> bool {
        self.chunk_type == ChunkType::Data && self.remaining_bytes == Some(0)
    }

    pub fn decode(mut buf: Bytes) -> anyhow::Result<Chunk> {
        let mut transfer_id = None;
        let mut session_id = None;
        let mut desired_session_id = None;
        let mut resource_id = None;
        let mut pending_bytes = None;
        let mut max_chunk_size_bytes = None;
        let mut min_delay_microseconds = None;
        let mut offset = 0;
        let mut data = Bytes::new();
        let mut remaining_bytes = None;
        let mut status = None;
        let mut window_end_offset = None;
        let mut chunk_type = None;
        let mut protocol_version = None;
        let mut initial_offset = 0;

        while buf.has_remaining() {
            let key = get_varint(&mut buf)?;
            let field = key >> 3;
            let wire_type = key & 7;

            if is_known_field(field) {
                let expected_wire_type = if field == FIELD_DATA { WIRE_TYPE_LEN } else { WIRE_TYPE_VARINT };
                if wire_type != expected_wire_type {
                    bail!("field {} has unexpected wire type {}", field, wire_type);
                }
            }

            match field {
                FIELD_TRANSFER_ID => transfer_id = Some(get_u32(&mut buf)?),
                FIELD_PENDING_BYTES => pending_bytes = Some(get_u32(&mut buf)?),
                FIELD_MAX_CHUNK_SIZE_BYTES => max_chunk_size_bytes = Some(get_u32(&mut buf)?),
                FIELD_MIN_DELAY_MICROSECONDS => min_delay_microseconds = Some(get_u32(&mut buf)?),
                FIELD_OFFSET => offset = get_varint(&mut buf)?,
                FIELD_DATA => {
                    let len = get_len(&mut buf)?;
                    data = buf.split_to(len);
                }
                FIELD_REMAINING_BYTES => remaining_bytes = Some(get_varint(&mut buf)?),
                FIELD_STATUS => status = Some(Status::from_wire(get_u32(&mut buf)?)),
                FIELD_WINDOW_END_OFFSET => window_end_offset = Some(get_varint(&mut buf)?),
                FIELD_TYPE => {
                    let raw = get_u32(&mut buf)?;
                    chunk_type = Some(ChunkType::try_from(raw)
                        .map_err(|_| anyhow!("unknown chunk type {}", raw))?);
                }
                FIELD_RESOURCE_ID => resource_id = Some(get_u32(&mut buf)?),
                FIELD_SESSION_ID => session_id = Some(get_u32(&mut buf)?),
                FIELD_PROTOCOL_VERSION => protocol_version = Some(ProtocolVersion::from_wire(get_u32(&mut buf)?)),
                FIELD_DESIRED_SESSION_ID => desired_session_id = Some(get_u32(&mut buf)?),
                FIELD_INITIAL_OFFSET => initial_offset = get_varint(&mut buf)?,
                _ => skip_field(&mut buf, wire_type)?,
            }
        }

        // a chunk without explicit version is legacy unless it carries a session id, which
        //  legacy peers never write
        let protocol_version = match protocol_version {
            Some(v) => v,
            None if session_id.is_some() => ProtocolVersion::VersionTwo,
            None => ProtocolVersion::Legacy,
        };

        let Some(session_id) = session_id.or(transfer_id).or(desired_session_id) else {
            bail!("chunk has neither a session id nor a transfer id");
        };

        if window_end_offset.is_none() {
            if let Some(pending_bytes) = pending_bytes {
                let pending_bytes: u64 = pending_bytes.safe_cast();
                window_end_offset = Some(offset.checked_add(pending_bytes)
                    .ok_or_else(|| anyhow!("window of {} bytes at offset {} overflows", pending_bytes, offset))?);
            }
        }

        let chunk_type = match chunk_type {
            Some(t) => t,
            None if status.is_some() => ChunkType::Completion,
            None if window_end_offset.is_some() => ChunkType::ParametersRetransmit,
            None => ChunkType::Data,
        };

        Ok(Chunk {
            protocol_version,
            chunk_type,
            session_id,
            desired_session_id,
            resource_id,
            offset,
            window_end_offset,
            max_chunk_size_bytes,
            min_delay_microseconds,
            data,
            remaining_bytes,
            status,
            initial_offset,
        })
    }

    /// Extracts the id a chunk is routed by without decoding it completely: the session id, or
    ///  the transfer id of a legacy chunk
    pub fn peek_session_id(raw: &Bytes) -> Option<u32> {
        let mut buf = raw.clone();
        let mut transfer_id = None;
        while buf.has_remaining() {
            let key = get_varint(&mut buf).ok()?;
            match (key >> 3, key & 7) {
                (FIELD_SESSION_ID, WIRE_TYPE_VARINT) => return get_u32(&mut buf).ok(),
                (FIELD_TRANSFER_ID, WIRE_TYPE_VARINT) => transfer_id = Some(get_u32(&mut buf).ok()?),
                (_, wire_type) => skip_field(&mut buf, wire_type).ok()?,
            }
        }
        transfer_id
    }

    /// Appends the encoded chunk to `buf`. Fails without touching `buf` if the encoded chunk
    ///  would exceed `max_len` bytes.
    pub fn encode(&self, buf: &mut BytesMut, max_len: usize) -> anyhow::Result<()> {
        let start = buf.len();
        let legacy = self.is_legacy();

        if legacy {
            put_varint_field(buf, FIELD_TRANSFER_ID, self.session_id.safe_cast());
        }
        else if self.chunk_type == ChunkType::Start {
            if let Some(resource_id) = self.resource_id {
                // lets a legacy server reject the START with a status chunk it understands
                put_varint_field(buf, FIELD_TRANSFER_ID, resource_id.safe_cast());
            }
        }

        if legacy || self.chunk_type == ChunkType::Start {
            if let Some(window_end_offset) = self.window_end_offset {
                let pending_bytes: u32 = window_end_offset.saturating_sub(self.offset).saturating_cast();
                put_varint_field(buf, FIELD_PENDING_BYTES, pending_bytes.safe_cast());
            }
        }

        if let Some(max_chunk_size_bytes) = self.max_chunk_size_bytes {
            put_varint_field(buf, FIELD_MAX_CHUNK_SIZE_BYTES, max_chunk_size_bytes.safe_cast());
        }
        if let Some(min_delay_microseconds) = self.min_delay_microseconds {
            put_varint_field(buf, FIELD_MIN_DELAY_MICROSECONDS, min_delay_microseconds.safe_cast());
        }
        if self.offset != 0 {
            put_varint_field(buf, FIELD_OFFSET, self.offset);
        }
        if !self.data.is_empty() {
            buf.put_u64_varint((FIELD_DATA << 3) | WIRE_TYPE_LEN);
            buf.put_u64_varint(self.data.len().safe_cast());
            buf.put_slice(&self.data);
        }
        if let Some(remaining_bytes) = self.remaining_bytes {
            put_varint_field(buf, FIELD_REMAINING_BYTES, remaining_bytes);
        }
        if let Some(status) = self.status {
            let raw: u32 = status.into();
            put_varint_field(buf, FIELD_STATUS, raw.safe_cast());
        }
        if let Some(window_end_offset) = self.window_end_offset {
            put_varint_field(buf, FIELD_WINDOW_END_OFFSET, window_end_offset);
        }
        let raw_type: u32 = self.chunk_type.into();
        put_varint_field(buf, FIELD_TYPE, raw_type.safe_cast());

        if !legacy {
            if let Some(resource_id) = self.resource_id {
                put_varint_field(buf, FIELD_RESOURCE_ID, resource_id.safe_cast());
            }
            if self.chunk_type != ChunkType::Start {
                put_varint_field(buf, FIELD_SESSION_ID, self.session_id.safe_cast());
            }
            if self.chunk_type.is_handshake() {
                let raw_version: u32 = self.protocol_version.into();
                put_varint_field(buf, FIELD_PROTOCOL_VERSION, raw_version.safe_cast());
            }
            if let Some(desired_session_id) = self.desired_session_id {
                put_varint_field(buf, FIELD_DESIRED_SESSION_ID, desired_session_id.safe_cast());
            }
            if self.initial_offset != 0 && matches!(self.chunk_type, ChunkType::Start | ChunkType::StartAck) {
                put_varint_field(buf, FIELD_INITIAL_OFFSET, self.initial_offset);
            }
        }

        let encoded_len = buf.len() - start;
        if encoded_len > max_len {
            buf.truncate(start);
            bail!("encoded {:?} chunk has {} bytes, exceeding the buffer size of {}", self.chunk_type, encoded_len, max_len);
        }
        Ok(())
    }
}

fn is_known_field(field: u64) -> bool {
    (FIELD_TRANSFER_ID..=FIELD_INITIAL_OFFSET).contains(&field)
}

fn put_varint_field(buf: &mut BytesMut, field: u64, value: u64) {
    buf.put_u64_varint((field << 3) | WIRE_TYPE_VARINT);
    buf.put_u64_varint(value);
}

fn get_varint(buf: &mut Bytes) -> anyhow::Result<u64> {
    buf.try_get_u64_varint()
        .map_err(|e| anyhow!("invalid varint: {:?}", e))
}

fn get_u32(buf: &mut Bytes) -> anyhow::Result<u32> {
    let raw = get_varint(buf)?;
    u32::try_from(raw)
        .map_err(|_| anyhow!("value {} does not fit a 32 bit field", raw))
}

fn get_len(buf: &mut Bytes) -> anyhow::Result<usize> {
    let len = get_varint(buf)?;
    if len > buf.remaining().safe_cast() {
        bail!("length-delimited field of {} bytes exceeds the remaining {} bytes", len, buf.remaining());
    }
    Ok(len as usize)
}

fn skip_field(buf: &mut Bytes, wire_type: u64) -> anyhow::Result<()> {
    let num_bytes = match wire_type {
        WIRE_TYPE_VARINT => {
            get_varint(buf)?;
            return Ok(());
        }
        WIRE_TYPE_FIXED64 => 8,
        WIRE_TYPE_LEN => get_len(buf)?,
        WIRE_TYPE_FIXED32 => 4,
        _ => bail!("unsupported wire type {}", wire_type),
    };
    if buf.remaining() < num_bytes {
        bail!("buffer underflow skipping a field of wire type {}", wire_type);
    }
    buf.advance(num_bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn encode(chunk: &Chunk) -> Bytes {
        let mut buf = BytesMut::new();
        chunk.encode(&mut buf, 1024).unwrap();
        buf.freeze()
    }

    fn legacy_wire(fields: &[(u64, u64)]) -> Bytes {
        let mut buf = BytesMut::new();
        for &(field, value) in fields {
            put_varint_field(&mut buf, field, value);
        }
        buf.freeze()
    }

    #[test]
    fn test_encode_versioned_data() {
        let mut chunk = Chunk::new(ProtocolVersion::VersionTwo, ChunkType::Data, 7);
        chunk.offset = 16;
        chunk.data = Bytes::from_static(b"abc");
        chunk.remaining_bytes = Some(0);

        let expected: &[u8] = &[
            0x28, 16,                  // offset
            0x32, 3, b'a', b'b', b'c', // data
            0x38, 0,                   // remaining_bytes
            0x50, 0,                   // type
            0x60, 7,                   // session_id
        ];
        assert_eq!(encode(&chunk).as_ref(), expected);
    }

    #[test]
    fn test_encode_legacy_parameters() {
        let mut chunk = Chunk::new(ProtocolVersion::Legacy, ChunkType::ParametersRetransmit, 3);
        chunk.offset = 100;
        chunk.window_end_offset = Some(164);
        chunk.max_chunk_size_bytes = Some(32);

        let expected: &[u8] = &[
            0x08, 3,    // transfer_id
            0x10, 64,   // pending_bytes
            0x18, 32,   // max_chunk_size_bytes
            0x28, 100,  // offset
            0x48, 164, 1, // window_end_offset
            0x50, 2,    // type
        ];
        assert_eq!(encode(&chunk).as_ref(), expected);
    }

    #[test]
    fn test_encode_versioned_start() {
        let mut chunk = Chunk::new(ProtocolVersion::VersionTwo, ChunkType::Start, 9);
        chunk.desired_session_id = Some(9);
        chunk.resource_id = Some(5);
        chunk.initial_offset = 2;

        let expected: &[u8] = &[
            0x08, 5,  // transfer_id = resource id
            0x50, 1,  // type
            0x58, 5,  // resource_id
            0x68, 2,  // protocol_version
            0x70, 9,  // desired_session_id
            0x78, 2,  // initial_offset
        ];
        assert_eq!(encode(&chunk).as_ref(), expected);
    }

    #[test]
    fn test_decode_versioned_start() {
        let mut chunk = Chunk::new(ProtocolVersion::VersionTwo, ChunkType::Start, 9);
        chunk.desired_session_id = Some(9);
        chunk.resource_id = Some(5);
        chunk.window_end_offset = Some(64);

        let decoded = Chunk::decode(encode(&chunk)).unwrap();
        assert_eq!(decoded.protocol_version, ProtocolVersion::VersionTwo);
        assert_eq!(decoded.chunk_type, ChunkType::Start);
        assert_eq!(decoded.desired_session_id, Some(9));
        assert_eq!(decoded.resource_id, Some(5));
        assert_eq!(decoded.window_end_offset, Some(64));
        assert!(decoded.is_initial_chunk());
    }

    #[test]
    fn test_decode_versioned_data() {
        let mut chunk = Chunk::new(ProtocolVersion::VersionTwo, ChunkType::Data, 1234567);
        chunk.offset = 1 << 40;
        chunk.data = Bytes::from_static(b"payload");
        let decoded = Chunk::decode(encode(&chunk)).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[rstest]
    #[case::status_means_completion(&[(FIELD_TRANSFER_ID, 3), (FIELD_STATUS, 5)], ChunkType::Completion)]
    #[case::parameters_at_zero(&[(FIELD_TRANSFER_ID, 3), (FIELD_PENDING_BYTES, 64)], ChunkType::ParametersRetransmit)]
    #[case::parameters_later(&[(FIELD_TRANSFER_ID, 3), (FIELD_OFFSET, 10), (FIELD_PENDING_BYTES, 64)], ChunkType::ParametersRetransmit)]
    #[case::window_end_without_pending(&[(FIELD_TRANSFER_ID, 3), (FIELD_OFFSET, 10), (FIELD_WINDOW_END_OFFSET, 64)], ChunkType::ParametersRetransmit)]
    #[case::otherwise_data(&[(FIELD_TRANSFER_ID, 3), (FIELD_OFFSET, 10)], ChunkType::Data)]
    #[case::explicit_type_wins(&[(FIELD_TRANSFER_ID, 3), (FIELD_PENDING_BYTES, 64), (FIELD_TYPE, 3)], ChunkType::ParametersContinue)]
    fn test_decode_legacy_type_inference(#[case] fields: &[(u64, u64)], #[case] expected: ChunkType) {
        let chunk = Chunk::decode(legacy_wire(fields)).unwrap();
        assert_eq!(chunk.protocol_version, ProtocolVersion::Legacy);
        assert_eq!(chunk.session_id, 3);
        assert_eq!(chunk.chunk_type, expected);
    }

    #[rstest]
    #[case::from_pending_bytes(&[(FIELD_TRANSFER_ID, 1), (FIELD_OFFSET, 100), (FIELD_PENDING_BYTES, 50)], Some(150))]
    #[case::explicit_wins(&[(FIELD_TRANSFER_ID, 1), (FIELD_OFFSET, 100), (FIELD_PENDING_BYTES, 50), (FIELD_WINDOW_END_OFFSET, 120)], Some(120))]
    #[case::none(&[(FIELD_TRANSFER_ID, 1), (FIELD_OFFSET, 100)], None)]
    fn test_decode_legacy_window(#[case] fields: &[(u64, u64)], #[case] expected: Option<u64>) {
        let chunk = Chunk::decode(legacy_wire(fields)).unwrap();
        assert_eq!(chunk.window_end_offset, expected);
    }

    #[test]
    fn test_decode_session_id_without_version_is_versioned() {
        let chunk = Chunk::decode(legacy_wire(&[(FIELD_SESSION_ID, 12), (FIELD_TYPE, 0)])).unwrap();
        assert_eq!(chunk.protocol_version, ProtocolVersion::VersionTwo);
        assert_eq!(chunk.session_id, 12);
    }

    #[test]
    fn test_decode_skips_unknown_fields() {
        let mut buf = BytesMut::new();
        put_varint_field(&mut buf, FIELD_SESSION_ID, 4);
        put_varint_field(&mut buf, 99, 12345);
        buf.put_u64_varint((100 << 3) | WIRE_TYPE_LEN);
        buf.put_u64_varint(3);
        buf.put_slice(b"xyz");
        buf.put_u64_varint((101 << 3) | WIRE_TYPE_FIXED32);
        buf.put_u32_le(7);
        buf.put_u64_varint((102 << 3) | WIRE_TYPE_FIXED64);
        buf.put_u64_le(7);
        put_varint_field(&mut buf, FIELD_OFFSET, 8);

        let chunk = Chunk::decode(buf.freeze()).unwrap();
        assert_eq!(chunk.session_id, 4);
        assert_eq!(chunk.offset, 8);
    }

    #[rstest]
    #[case::no_id(&[0x28, 5])]
    #[case::truncated_varint(&[0x08, 0x80])]
    #[case::truncated_data(&[0x08, 1, 0x32, 5, b'a'])]
    #[case::unknown_type(&[0x08, 1, 0x50, 42])]
    #[case::wrong_wire_type(&[0x0d, 1, 2, 3, 4])]
    #[case::oversized_u32(&[0x08, 0xff, 0xff, 0xff, 0xff, 0x1f])]
    #[case::window_overflow(&[0x08, 3, 0x28, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01, 0x10, 10])]
    fn test_decode_malformed(#[case] raw: &'static [u8]) {
        assert!(Chunk::decode(Bytes::from_static(raw)).is_err());
    }

    #[rstest]
    #[case::versioned(ProtocolVersion::VersionTwo, ChunkType::Data, Some(17))]
    #[case::legacy(ProtocolVersion::Legacy, ChunkType::ParametersRetransmit, Some(17))]
    #[case::start_by_resource(ProtocolVersion::VersionTwo, ChunkType::Start, Some(3))]
    fn test_peek_session_id(#[case] version: ProtocolVersion, #[case] chunk_type: ChunkType, #[case] expected: Option<u32>) {
        let mut chunk = Chunk::new(version, chunk_type, 17);
        chunk.resource_id = Some(3);
        chunk.offset = 300;
        chunk.window_end_offset = Some(400);
        assert_eq!(Chunk::peek_session_id(&encode(&chunk)), expected);
        assert_eq!(Chunk::peek_session_id(&Bytes::from_static(&[0x28, 5])), None);
    }

    #[test]
    fn test_encode_exceeding_capacity() {
        let mut chunk = Chunk::new(ProtocolVersion::VersionTwo, ChunkType::Data, 1);
        chunk.data = Bytes::from(vec![0u8; 100]);

        let mut buf = BytesMut::new();
        buf.put_u8(99);
        assert!(chunk.encode(&mut buf, 100).is_err());
        assert_eq!(buf.as_ref(), &[99]);

        assert!(chunk.encode(&mut buf, 100 + MAX_CHUNK_OVERHEAD).is_ok());
    }

    #[rstest]
    #[case::versioned_start(ProtocolVersion::VersionTwo, ChunkType::Start, 0, false, true)]
    #[case::versioned_parameters(ProtocolVersion::VersionTwo, ChunkType::ParametersRetransmit, 0, false, false)]
    #[case::legacy_start(ProtocolVersion::Legacy, ChunkType::Start, 0, false, true)]
    #[case::legacy_parameters_at_zero(ProtocolVersion::Legacy, ChunkType::ParametersRetransmit, 0, false, true)]
    #[case::legacy_parameters_later(ProtocolVersion::Legacy, ChunkType::ParametersRetransmit, 10, false, false)]
    #[case::legacy_empty_data_at_zero(ProtocolVersion::Legacy, ChunkType::Data, 0, false, true)]
    #[case::legacy_data_with_payload(ProtocolVersion::Legacy, ChunkType::Data, 0, true, false)]
    fn test_is_initial_chunk(#[case] version: ProtocolVersion, #[case] chunk_type: ChunkType, #[case] offset: u64, #[case] with_data: bool, #[case] expected: bool) {
        let mut chunk = Chunk::new(version, chunk_type, 1);
        chunk.offset = offset;
        if with_data {
            chunk.data = Bytes::from_static(b"x");
        }
        assert_eq!(chunk.is_initial_chunk(), expected);
    }
}
