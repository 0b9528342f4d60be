//! Error types for encoding/decoding and protocol processing
use std::net::AddrParseError;

use thiserror::Error;

use crate::apdu::{AbortReason, ErrorClass, ErrorCode, RejectReason};

/// Convenience type for decode errors
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Returned from types that decode
#[derive(Error, Debug)]
pub enum DecodeError {
    /// add overflow
    #[error("decoder checked_add failed")]
    AddOverflow,

    /// ran out of bytes
    #[error("parser ran out of data-- not enough bytes")]
    NotEnoughBytes,

    /// error converting from slice
    #[error("error converting from slice {0}")]
    SliceError(#[from] core::array::TryFromSliceError),

    /// error converting to utf-8
    #[error("error converting to UTF-8 {0}")]
    Utf8Error(#[from] core::str::Utf8Error),

    /// tag class or number did not match what the caller expected
    #[error("invalid tag: expected {expected}, found {found}")]
    InvalidTag {
        /// what the decoder was looking for
        expected: &'static str,
        /// what was actually next in the stream
        found: String,
    },

    /// opening/closing tag nesting does not balance
    #[error("unbalanced opening/closing tags at context {0}")]
    UnbalancedTags(u8),

    /// value outside the type's domain
    #[error("value out of range for {0}")]
    OutOfRange(&'static str),

    /// a required sequence element was absent
    #[error("missing required element {0}")]
    MissingElement(&'static str),

    /// none of a choice's alternatives matched
    #[error("no matching choice alternative for {0}")]
    NoMatchingChoice(&'static str),

    /// invalid data error
    #[error("invalid data error {0} msg {1}")]
    InvalidData(u32, &'static str),

    /// Unknown decode error
    #[error("unknown error")]
    Unknown(Box<dyn core::error::Error + Send + Sync + 'static>),
}

/// Returned from types that encode
#[derive(Error, Debug)]
pub enum EncodeError {
    /// addition overflow
    #[error("encoder checked_add failed")]
    AddOverflow,

    /// value cannot be represented on the wire
    #[error("value out of range for {0}")]
    OutOfRange(&'static str),

    /// a required sequence element was not supplied
    #[error("missing required element {0}")]
    MissingElement(&'static str),

    /// payload exceeds what the frame can carry
    #[error("payload of {len} octets exceeds the maximum of {max}")]
    TooLong {
        /// octets requested
        len: usize,
        /// frame maximum
        max: usize,
    },
}

/// Convenience type for encode errors
pub type EncodeResult<T> = std::result::Result<T, EncodeError>;

/// Top-level error for stack operations; confirmed-service futures resolve
/// with one of these when the peer (or the local stack) fails the request
#[derive(Error, Debug)]
pub enum Error {
    /// codec failure while decoding a frame
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// codec failure while building a frame
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// BACnet Error PDU, or locally raised service failure
    #[error("error {class:?}/{code:?}")]
    Execution {
        /// error class (Clause 18)
        class: ErrorClass,
        /// error code within the class
        code: ErrorCode,
    },

    /// BACnet Reject PDU (Clause 18.8)
    #[error("rejected: {0:?}")]
    Reject(RejectReason),

    /// BACnet Abort PDU (Clause 18.9)
    #[error("aborted: {0:?}")]
    Abort(AbortReason),

    /// no route to the destination network
    #[error("no route to network {0}")]
    UnknownRoute(u16),

    /// binding or topology mistake caught at startup
    #[error("configuration error: {0}")]
    Config(&'static str),

    /// the request was cancelled before a resolution arrived
    #[error("request cancelled")]
    Cancelled,

    /// address string did not parse
    #[error("address parse error: {0}")]
    AddrParse(String),

    /// link-layer I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// shorthand for an execution error
    pub fn execution(class: ErrorClass, code: ErrorCode) -> Self {
        Error::Execution { class, code }
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Self {
        Error::AddrParse(e.to_string())
    }
}

/// Convenience type for stack operations
pub type Result<T> = std::result::Result<T, Error>;
