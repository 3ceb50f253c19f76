//! Errors that can occur while encoding or decoding protocol frames.

use thiserror::Error;

use super::response::CqlResponseKind;

/// An error while reading the fixed 9-byte frame header or the frame body
/// from the wire. All of these are fatal for the connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] LowLevelDeserializationError),
    #[error("Frame is from the client's direction, expected a response")]
    FrameFromClient,
    #[error("Frame declares protocol version {0}, which this connection did not negotiate")]
    VersionMismatch(u8),
    #[error("Unknown response opcode: {0:#04x}")]
    UnknownResponseOpcode(u8),
    #[error("Frame length {length} exceeds the configured limit of {limit} bytes")]
    FrameTooLarge { length: usize, limit: usize },
    #[error("Connection was closed before a whole frame arrived: missing {0} out of {1} bytes")]
    ConnectionClosed(usize, usize),
    #[error("Frame is compressed, but no compression was negotiated for the connection")]
    NoCompressionNegotiated,
    #[error("Failed to serialize the request body: {0}")]
    BodySerialization(#[from] RequestSerializationError),
    #[error("Body compression failed")]
    BodyCompression,
    #[error("Body decompression failed")]
    BodyDecompression,
    #[error("Segment checksum mismatch: computed {computed:#010x}, frame carries {carried:#010x}")]
    SegmentChecksumMismatch { computed: u32, carried: u32 },
    #[error("Segment payload length {0} exceeds the maximum of {max}", max = super::segment::MAX_SEGMENT_PAYLOAD)]
    SegmentTooLarge(usize),
    #[error("IO error: {0}")]
    Io(std::sync::Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(std::sync::Arc::new(err))
    }
}

/// An error while serializing a request frame body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestSerializationError {
    #[error("Value too large to be encoded in the frame: {0}")]
    ValueTooLarge(#[from] std::num::TryFromIntError),
    #[error("Too many values in a request: {0} (maximum is u16::MAX)")]
    TooManyValues(usize),
}

/// An error while deserializing a response frame body of a particular kind.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResponseParseError {
    #[error("Malformed {kind} response: {source}")]
    Malformed {
        kind: CqlResponseKind,
        source: LowLevelDeserializationError,
    },
    #[error("ERROR response carries unknown error code {0:#010x}")]
    UnknownErrorCode(i32),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Unknown type of cluster change: {0}")]
    UnknownChangeType(String),
    #[error("Unknown target of schema change: {0}")]
    UnknownSchemaChangeTarget(String),
    #[error("RESULT response has unknown result id {0:#010x}")]
    UnknownResultId(i32),
    #[error("RESULT response carries unknown type option id {0:#06x}")]
    UnknownTypeOption(u16),
}

impl ResponseParseError {
    pub(crate) fn malformed(
        kind: CqlResponseKind,
    ) -> impl Fn(LowLevelDeserializationError) -> Self + Copy {
        move |source| ResponseParseError::Malformed { kind, source }
    }
}

/// A low-level error while pulling primitive wire types out of a buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error("Too few bytes left in the buffer: expected {expected}, got {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Length is negative or does not fit in usize: {0}")]
    InvalidLength(i32),
    #[error("[value] length must be >= -2, got {0}")]
    InvalidValueLength(i32),
    #[error("String is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Invalid inet length: {0} (expected 4 or 16)")]
    InvalidInetLength(u8),
    #[error("Unknown consistency value: {0:#06x}")]
    UnknownConsistency(u16),
    #[error("Expected serial consistency, got {0:#06x}")]
    NonSerialConsistency(u16),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(_: std::io::Error) -> Self {
        // The only way std::io::Error arises from in-memory reads is buffer exhaustion.
        LowLevelDeserializationError::TooFewBytesReceived {
            expected: 1,
            received: 0,
        }
    }
}

impl From<std::num::TryFromIntError> for LowLevelDeserializationError {
    fn from(_: std::num::TryFromIntError) -> Self {
        LowLevelDeserializationError::InvalidLength(-1)
    }
}
