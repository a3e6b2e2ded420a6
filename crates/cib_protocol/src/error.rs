//! Protocol error types

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Truncated packet: expected {expected} bytes, got {got}")]
    TruncatedPacket { expected: usize, got: usize },

    #[error("Invalid trigger bit {0}: must be in 0..=31")]
    InvalidTriggerBit(u8),

    #[error("Control reply is not a single JSON object: {0}")]
    MalformedReply(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}
