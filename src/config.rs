use std::cmp::min;
use std::time::Duration;
use anyhow::bail;

use crate::chunk::{ProtocolVersion, MAX_CHUNK_OVERHEAD};

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// The biggest payload the receiving side of a session asks for in a single DATA chunk.
    ///
    /// The effective value is further limited by the encode buffer: a chunk's payload plus
    ///  its header must fit into `encode_buffer_size`.
    pub max_chunk_size_bytes: u32,

    /// Upper bound for the receive window, i.e. the number of bytes a transmitter may send
    ///  ahead of the receiver's acknowledged offset. The window starts at a single chunk and
    ///  grows towards this limit as long as no loss is detected.
    pub max_window_size_bytes: u64,

    /// The receiver extends its window when the part of the window still outstanding shrinks
    ///  to `window_size / extend_window_divisor`. Bigger values mean fewer parameters chunks,
    ///  but a higher risk of the transmitter stalling at the end of its window.
    pub extend_window_divisor: u32,

    /// Time to wait for the peer's next chunk before retrying
    pub chunk_timeout: Duration,

    /// Time to wait for the response to the very first chunk of a session. This is typically
    ///  longer than `chunk_timeout` because the peer may need to prepare a resource first.
    pub initial_chunk_timeout: Duration,

    /// Number of consecutive timeouts without any chunk from the peer. The first timeout after
    ///  this many retries ends the session with `DeadlineExceeded`.
    pub max_retries: u32,

    /// Total number of retries over a session's lifetime, as a safety net against peers that
    ///  keep responding without ever making progress
    pub max_lifetime_retries: u32,

    /// Number of client transfers that can be active concurrently
    pub max_client_transfers: usize,
    /// Number of server transfers that can be active concurrently
    pub max_server_transfers: usize,

    /// Size of the single buffer all outgoing chunks are encoded into
    pub encode_buffer_size: usize,

    /// Protocol version for client transfers that do not explicitly request one
    pub default_protocol_version: ProtocolVersion,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            max_chunk_size_bytes: 1024,
            max_window_size_bytes: 32 * 1024,
            extend_window_divisor: 2,
            chunk_timeout: Duration::from_secs(2),
            initial_chunk_timeout: Duration::from_secs(4),
            max_retries: 3,
            max_lifetime_retries: 1500,
            max_client_transfers: 4,
            max_server_transfers: 8,
            encode_buffer_size: 1024 + MAX_CHUNK_OVERHEAD,
            default_protocol_version: ProtocolVersion::LATEST,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.encode_buffer_size <= MAX_CHUNK_OVERHEAD {
            bail!("encode buffer size must be bigger than the chunk overhead of {} bytes", MAX_CHUNK_OVERHEAD);
        }
        if self.max_chunk_size_bytes == 0 {
            bail!("max chunk size must be positive");
        }
        if self.max_window_size_bytes == 0 {
            bail!("max window size must be positive");
        }
        if self.extend_window_divisor == 0 {
            bail!("extend window divisor must be positive");
        }
        if self.chunk_timeout.is_zero() || self.initial_chunk_timeout.is_zero() {
            bail!("chunk timeouts must be positive");
        }
        if self.max_lifetime_retries < self.max_retries {
            bail!("max lifetime retries ({}) must not be smaller than max retries ({})", self.max_lifetime_retries, self.max_retries);
        }
        if self.max_client_transfers == 0 && self.max_server_transfers == 0 {
            bail!("at least one client or server transfer must be allowed");
        }
        if self.default_protocol_version == ProtocolVersion::Unknown {
            bail!("default protocol version must be a concrete version");
        }
        Ok(())
    }

    /// The payload that fits into a single encoded chunk
    pub fn max_payload_len(&self) -> usize {
        self.encode_buffer_size - MAX_CHUNK_OVERHEAD
    }

    /// The chunk size a receiver advertises, i.e. the configured size limited by what fits into
    ///  the encode buffer
    pub fn effective_max_chunk_size(&self) -> u32 {
        // bounded by max_chunk_size_bytes, so it fits
        min(self.max_chunk_size_bytes as u64, self.max_payload_len() as u64) as u32
    }
}

/// Per-transfer overrides of [TransferConfig] for client transfers
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub protocol_version: Option<ProtocolVersion>,
    pub chunk_timeout: Option<Duration>,
    pub initial_chunk_timeout: Option<Duration>,
    /// Resume a transfer at this offset. Requires a versioned peer whose resource supports it.
    pub initial_offset: u64,
}

impl TransferOptions {
    pub fn with_protocol_version(mut self, protocol_version: ProtocolVersion) -> TransferOptions {
        self.protocol_version = Some(protocol_version);
        self
    }

    pub fn with_initial_offset(mut self, initial_offset: u64) -> TransferOptions {
        self.initial_offset = initial_offset;
        self
    }

    pub fn with_chunk_timeout(mut self, chunk_timeout: Duration) -> TransferOptions {
        self.chunk_timeout = Some(chunk_timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safe_converter::PrecheckedCast;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(TransferConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::tiny_buffer(|c: &mut TransferConfig| c.encode_buffer_size = MAX_CHUNK_OVERHEAD)]
    #[case::zero_chunk(|c: &mut TransferConfig| c.max_chunk_size_bytes = 0)]
    #[case::zero_window(|c: &mut TransferConfig| c.max_window_size_bytes = 0)]
    #[case::zero_divisor(|c: &mut TransferConfig| c.extend_window_divisor = 0)]
    #[case::zero_timeout(|c: &mut TransferConfig| c.chunk_timeout = Duration::ZERO)]
    #[case::lifetime_below_retries(|c: &mut TransferConfig| c.max_lifetime_retries = 2)]
    #[case::no_transfers(|c: &mut TransferConfig| { c.max_client_transfers = 0; c.max_server_transfers = 0; })]
    #[case::unknown_version(|c: &mut TransferConfig| c.default_protocol_version = ProtocolVersion::Unknown)]
    fn test_validate_rejects(#[case] modify: fn(&mut TransferConfig)) {
        let mut config = TransferConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::limited_by_config(1024, 4096, 1024)]
    #[case::limited_by_buffer(1024, 512, 512 - MAX_CHUNK_OVERHEAD as u32)]
    fn test_effective_max_chunk_size(#[case] max_chunk_size: u32, #[case] encode_buffer_size: usize, #[case] expected: u32) {
        let config = TransferConfig {
            max_chunk_size_bytes: max_chunk_size,
            encode_buffer_size,
            ..TransferConfig::default()
        };
        assert_eq!(config.effective_max_chunk_size(), expected);
    }

    #[test]
    fn test_max_payload_len() {
        let config = TransferConfig::default();
        let payload: u64 = config.effective_max_chunk_size().into();
        assert_eq!(PrecheckedCast::<usize>::prechecked_cast(payload), config.max_payload_len());
    }
}
