//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than the envelope header.
    #[error("frame truncated: {len} bytes, header needs {needed}")]
    Truncated {
        /// Bytes available.
        len: usize,
        /// Bytes required.
        needed: usize,
    },

    /// Frame does not start with the protocol magic.
    #[error("invalid frame magic: {found:02x?}")]
    InvalidMagic {
        /// The bytes found in place of the magic.
        found: [u8; 2],
    },

    /// Frame version is not supported.
    #[error("unsupported protocol version {found}, expected {expected}")]
    UnsupportedVersion {
        /// Version found in the frame.
        found: u8,
        /// Version this build speaks.
        expected: u8,
    },

    /// Unknown message type code.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// An enum field held an unmapped integer.
    #[error("invalid {field} value {value}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// The offending integer.
        value: u8,
    },

    /// The CBOR body could not be decoded.
    #[error("malformed body: {0}")]
    MalformedBody(String),

    /// The body could not be encoded.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// Bytes remained after the body.
    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),
}

impl ProtocolError {
    /// Creates a malformed-body error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedBody(msg.into())
    }
}
