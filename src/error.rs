//! Error kinds shared across the crate.
//!
//! Failures that happen on the remote side travel back as a [`RemoteError`]
//! inside an ERROR envelope. Failures that happen locally (timeouts, a dropped
//! connection) surface as a [`CallError`] from the waiting promise.

use crate::{
    codec::{Decode, DecodeError, Encode, WireReader, WireWrite},
    protocol::RegistryError,
    types::Type,
};
use std::{fmt, io};
use thiserror::Error;

/// Numeric error code carried in ERROR envelopes.
///
/// The high byte names the family: `0x01` decode, `0x02` dispatch, `0x03`
/// handler, `0x04` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    TypeMismatch,
    BufferUnderrun,
    MalformedPayload,
    ProtocolNotFound,
    MemberNotFound,
    FeedNotFound,
    Handler,
    UnknownMessage,
    /// A code this build does not know about.
    Other(u16),
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::TypeMismatch => 0x0101,
            ErrorCode::BufferUnderrun => 0x0102,
            ErrorCode::MalformedPayload => 0x0103,
            ErrorCode::ProtocolNotFound => 0x0201,
            ErrorCode::MemberNotFound => 0x0202,
            ErrorCode::FeedNotFound => 0x0203,
            ErrorCode::Handler => 0x0301,
            ErrorCode::UnknownMessage => 0x0401,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0101 => ErrorCode::TypeMismatch,
            0x0102 => ErrorCode::BufferUnderrun,
            0x0103 => ErrorCode::MalformedPayload,
            0x0201 => ErrorCode::ProtocolNotFound,
            0x0202 => ErrorCode::MemberNotFound,
            0x0203 => ErrorCode::FeedNotFound,
            0x0301 => ErrorCode::Handler,
            0x0401 => ErrorCode::UnknownMessage,
            other => ErrorCode::Other(other),
        }
    }

    pub fn is_decode(self) -> bool {
        self.as_u16() >> 8 == 0x01
    }

    pub fn is_dispatch(self) -> bool {
        self.as_u16() >> 8 == 0x02
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#06x})", self, self.as_u16())
    }
}

/// Error descriptor sent back in an ERROR envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Encode for RemoteError {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        w.put_tag(Type::Struct);
        w.put_len(2);
        self.code.as_u16().encode(w);
        self.message.encode(w);
    }
}

impl Decode for RemoteError {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.expect_struct(2)?;
        let code = ErrorCode::from_u16(u16::decode(r)?);
        let message = String::decode(r)?;
        Ok(Self { code, message })
    }
}

/// Why a promise did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("call timed out")]
    Timeout,

    #[error("could not deliver request")]
    CouldNotDeliver,

    #[error("call cancelled")]
    Cancelled,

    #[error("failed to decode result: {0}")]
    Decode(#[from] DecodeError),
}

impl CallError {
    /// Remote error code, if the failure came back from the peer.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            CallError::Remote(err) => Some(err.code),
            _ => None,
        }
    }
}

/// Transport and setup failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("registration failed: {0}")]
    Registry(#[from] RegistryError),
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
