use std::{io, time::Duration};

use thiserror::Error;

/// Failures of the wire codec.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid command name: {0}")]
    InvalidCommandName(String),
    #[error("Payload is too big: {size} bytes, max is {max}")]
    PayloadOverSizeLimit { size: usize, max: usize },
    #[error("Serialization error: {0}")]
    Serialization(io::Error),
    #[error("Deserialization error: {0}")]
    Deserialization(io::Error),
    #[error("Could not parse header: {0}")]
    HeaderFailedParsing(String),
    #[error("Unexpected network magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("Checksum mismatch: header says {expected:02x?}, payload hashes to {actual:02x?}")]
    ChecksumMismatch { expected: [u8; 4], actual: [u8; 4] },
}

/// Failures reported by a [`crate::Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Disconnected,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Decode(#[from] MessageError),
    /// The outgoing message could not be framed. Nothing was written.
    #[error("cannot encode message: {0}")]
    Encode(MessageError),
}

/// Why a peer's version announcement was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("peer protocol version {version} is older than the minimum {minimum}")]
    Obsolete { version: i32, minimum: i32 },
    #[error("peer clock is off by {offset}s, tolerance is {tolerance}s")]
    ClockSkew { offset: i64, tolerance: i64 },
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("expected `{expected}` but peer sent `{received}`")]
    UnexpectedMessage {
        expected: &'static str,
        received: String,
    },
    #[error("peer rejected: {0}")]
    Rejected(#[from] ValidationFailure),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("transport is not connected")]
    NotConnected,
    #[error("no version received from the peer")]
    MissingPeerVersion,
    #[error("handshake was already attempted on this connection")]
    AlreadyAttempted,
}
