//! Bridge error types
//!
//! Transport and protocol failures are deliberately distinct variants:
//! a broken socket kills the command or the run, while explicit error
//! feedback from the board leaves the socket usable and is reported to
//! the host.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Transport failure on either socket: resolve, connect, bind,
    /// read, write, or unexpected EOF.
    #[error("CIB hardware communication error: {0}")]
    Communication(String),

    /// Command issued in a state that forbids it.
    #[error("CIB in the wrong state: {0}")]
    WrongState(String),

    /// Internal invariant violated (handshake timeout, malformed
    /// configuration).
    #[error("CIB module error: {0}")]
    Module(String),

    /// Structured relay of a board-side feedback entry.
    #[error("Message from CIB: {0}")]
    Message(String),

    /// Data-plane decode anomaly; logged, never fatal.
    #[error("CIB buffer issue: {0}")]
    Buffer(String),
}

impl BridgeError {
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    pub fn wrong_state(msg: impl Into<String>) -> Self {
        Self::WrongState(msg.into())
    }

    pub fn module(msg: impl Into<String>) -> Self {
        Self::Module(msg.into())
    }
}
