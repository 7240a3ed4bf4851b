//! Wire engine error types and error categories.

use crate::wire::WireType;
use protonet_cache::CacheError;
use std::fmt;
use thiserror::Error;

/// Errors raised while encoding or decoding the wire format.
///
/// Every error is fatal for the operation in progress; nothing here is
/// retried or recovered internally.
#[derive(Debug, Error)]
pub enum ProtoError {
    // Contract violations
    #[error("invalid field number: {0}")]
    InvalidFieldNumber(u64),

    #[error("invalid wire type: {0}")]
    InvalidWireType(u8),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("cannot {operation} a {wire_type} field")]
    WireTypeMismatch {
        operation: &'static str,
        wire_type: WireType,
    },

    #[error("value out of range for {target}")]
    ValueOutOfRange { target: &'static str },

    // Framing
    #[error("group mismatch: expected end of group {expected}, got {actual}")]
    GroupMismatch { expected: u32, actual: u32 },

    #[error("unexpected end group for field {0}")]
    UnexpectedEndGroup(u32),

    #[error("sub-item ended out of order (expected depth {expected}, got {actual})")]
    FrameMismatch { expected: usize, actual: usize },

    #[error("unbalanced sub-items: {open} still open")]
    UnbalancedFrames { open: usize },

    #[error("truncated message at position {position} (expected data up to {expected_end})")]
    TruncatedMessage { position: u64, expected_end: u64 },

    #[error("read past end of sub-item: position {position}, end {end}")]
    FrameOverrun { position: u64, end: u64 },

    #[error("sub-item length mismatch: declared {declared}, written {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    // Malformed input
    #[error("malformed varint at position {position}")]
    MalformedVarint { position: u64 },

    #[error("invalid UTF-8 in string at position {position}")]
    InvalidUtf8 { position: u64 },

    #[error("length {length} exceeds remaining {remaining} bytes")]
    LengthOutOfRange { length: u64, remaining: u64 },

    #[error("cannot {operation} a {wire_type} field in the input")]
    UnexpectedWireType {
        operation: &'static str,
        wire_type: WireType,
    },

    // Resource limits
    #[error("recursion depth {depth} exceeds limit {max}")]
    RecursionLimitExceeded { depth: usize, max: usize },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u64, max: u64 },

    #[error("possible recursion detected (offset: {offset} level(s))")]
    RecursionDetected { offset: usize },

    // Cache consistency
    #[error("object cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad classes of [`ProtoError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Mismatched groups, unbalanced or truncated sub-items.
    Framing,
    /// Invalid varints, corrupt UTF-8, impossible lengths.
    MalformedInput,
    /// Depth or size limits exceeded.
    ResourceLimit,
    /// Object cache inconsistencies.
    CacheConsistency,
    /// Caller misuse: bad field numbers, out-of-order calls.
    Contract,
    /// The underlying byte stream failed.
    Io,
}

impl ProtoError {
    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProtoError::InvalidFieldNumber(_)
            | ProtoError::InvalidState(_)
            | ProtoError::WireTypeMismatch { .. }
            | ProtoError::ValueOutOfRange { .. } => ErrorCategory::Contract,

            ProtoError::GroupMismatch { .. }
            | ProtoError::UnexpectedEndGroup(_)
            | ProtoError::FrameMismatch { .. }
            | ProtoError::UnbalancedFrames { .. }
            | ProtoError::TruncatedMessage { .. }
            | ProtoError::FrameOverrun { .. }
            | ProtoError::LengthMismatch { .. } => ErrorCategory::Framing,

            ProtoError::InvalidWireType(_)
            | ProtoError::MalformedVarint { .. }
            | ProtoError::InvalidUtf8 { .. }
            | ProtoError::LengthOutOfRange { .. }
            | ProtoError::UnexpectedWireType { .. } => ErrorCategory::MalformedInput,

            ProtoError::RecursionLimitExceeded { .. }
            | ProtoError::MessageTooLarge { .. }
            | ProtoError::RecursionDetected { .. } => ErrorCategory::ResourceLimit,

            ProtoError::Cache(_) => ErrorCategory::CacheConsistency,
            ProtoError::Io(_) => ErrorCategory::Io,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Framing => write!(f, "FRAMING"),
            ErrorCategory::MalformedInput => write!(f, "MALFORMED_INPUT"),
            ErrorCategory::ResourceLimit => write!(f, "RESOURCE_LIMIT"),
            ErrorCategory::CacheConsistency => write!(f, "CACHE_CONSISTENCY"),
            ErrorCategory::Contract => write!(f, "CONTRACT"),
            ErrorCategory::Io => write!(f, "IO"),
        }
    }
}
