//! CIB wire protocol
//!
//! Everything exchanged with the Central Instrumentation Board, in both
//! directions:
//!
//! - the binary trigger stream the board pushes at the bridge (a packed
//!   4-byte header followed by one 16-byte trigger word per packet),
//! - the JSON command/feedback exchange on the control socket,
//! - the two downstream artifacts built from each trigger (the 7-word
//!   raw frame and the logical event record),
//! - the typed configuration document accepted by `conf`.
//!
//! This crate is pure data and validation. It never opens a socket; the
//! runtime in `cib_bridge` drives it.

pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod wire;

pub use config::{CalibrationConf, Conf};
pub use control::{ControlCommand, ControlReply, Feedback, Severity};
pub use error::{ProtocolError, Result};
pub use frame::{HsiEvent, RawFrame, DAQ_HEADER_WORD};
pub use wire::{SequenceGap, SequenceTracker, TcpHeader, TriggerWord};
