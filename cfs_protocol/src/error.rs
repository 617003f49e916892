//! Protocol error types.

use cfs_core::FsError;
use thiserror::Error;

use crate::session::SessionState;

/// Numeric reason codes carried by handshake and request rejections.
pub mod codes {
    pub const BAD_HANDSHAKE_NONCE: u32 = 1000;
    pub const BAD_HANDSHAKE_KEY: u32 = 1100;
    pub const BAD_HANDSHAKE_ACK: u32 = 1200;
    pub const BAD_HANDSHAKE_VERIFY: u32 = 1300;

    pub const BAD_REQUEST_NONCE: u32 = 2000;
    pub const BAD_REQUEST_OPERATION: u32 = 2100;

    pub const BAD_REQUEST_DRIVE_KEY_LENGTH: u32 = 3210;
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Handshake verification failed; the connection must be torn down.
    #[error("bad handshake ({code}): {message}")]
    BadHandshake { code: u32, message: String },

    /// A request failed structural validation before dispatch.
    #[error("bad request ({code}): {message}")]
    BadRequest { code: u32, message: String },

    /// A session state transition outside the legal edge table.
    #[error("invalid session state transition: {current:?} -> {target:?}")]
    InvalidState {
        current: SessionState,
        target: SessionState,
    },

    /// A response whose nonce is not the hash of the request nonce.
    #[error("bad response nonce")]
    BadNonce,

    /// The remote replied with an error response.
    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },

    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("unknown frame type {0}")]
    UnknownFrame(u8),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("cbor: {0}")]
    Cbor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Fs(#[from] FsError),
}

impl ProtocolError {
    pub fn bad_handshake(code: u32, message: impl Into<String>) -> Self {
        Self::BadHandshake {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: u32, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }
}

impl From<minicbor::decode::Error> for ProtocolError {
    fn from(err: minicbor::decode::Error) -> Self {
        Self::Cbor(err.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for ProtocolError {
    fn from(err: minicbor::encode::Error<E>) -> Self {
        Self::Cbor(err.to_string())
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
