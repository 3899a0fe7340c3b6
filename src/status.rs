use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The outcome of a transfer, carried in the `status` field of terminal chunks and reported to
///  the completion callback (client) or the resource handler (server).
///
/// The numeric values are part of the wire format. They follow the conventional status code
///  space of the RPC layer the protocol runs on, so peers written against that layer can
///  interpret them without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, thiserror::Error)]
#[repr(u32)]
pub enum Status {
    #[error("ok")]
    Ok = 0,
    #[error("cancelled")]
    Cancelled = 1,
    #[error("unknown")]
    Unknown = 2,
    /// A chunk was malformed or lacked a required field
    #[error("invalid argument")]
    InvalidArgument = 3,
    /// The retry budget was exhausted
    #[error("deadline exceeded")]
    DeadlineExceeded = 4,
    #[error("not found")]
    NotFound = 5,
    #[error("already exists")]
    AlreadyExists = 6,
    #[error("permission denied")]
    PermissionDenied = 7,
    /// No free session slot, or the receiver has no write capacity left
    #[error("resource exhausted")]
    ResourceExhausted = 8,
    /// A chunk arrived for a session that is not pending
    #[error("failed precondition")]
    FailedPrecondition = 9,
    /// The session was superseded by a new session on the same identifier
    #[error("aborted")]
    Aborted = 10,
    #[error("out of range")]
    OutOfRange = 11,
    /// Seeking was requested, but the backing resource does not support it
    #[error("unimplemented")]
    Unimplemented = 12,
    /// A protocol invariant was violated, or the transport failed
    #[error("internal")]
    Internal = 13,
    /// A resource handler temporarily cannot prepare
    #[error("unavailable")]
    Unavailable = 14,
    /// Reading or writing the backing resource failed
    #[error("data loss")]
    DataLoss = 15,
    #[error("unauthenticated")]
    Unauthenticated = 16,
}

impl Status {
    /// Status values from the wire that are outside the known range are mapped to
    ///  [Status::Unknown] rather than rejected, since the chunk carrying them is terminal anyway.
    pub fn from_wire(raw: u32) -> Status {
        Status::try_from(raw).unwrap_or(Status::Unknown)
    }

    pub fn is_ok(&self) -> bool {
        *self == Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::ok(0, Status::Ok)]
    #[case::deadline(4, Status::DeadlineExceeded)]
    #[case::data_loss(15, Status::DataLoss)]
    #[case::last(16, Status::Unauthenticated)]
    #[case::out_of_range(17, Status::Unknown)]
    #[case::huge(u32::MAX, Status::Unknown)]
    fn test_from_wire(#[case] raw: u32, #[case] expected: Status) {
        assert_eq!(Status::from_wire(raw), expected);
    }

    #[rstest]
    #[case(Status::Ok, 0)]
    #[case(Status::ResourceExhausted, 8)]
    #[case(Status::Internal, 13)]
    fn test_to_wire(#[case] status: Status, #[case] expected: u32) {
        let raw: u32 = status.into();
        assert_eq!(raw, expected);
    }
}
