//! CIB bridge runtime
//!
//! Bridges one Central Instrumentation Board into a DAQ fabric. The
//! lifecycle controller ([`CibBridge`]) owns a synchronous JSON control
//! channel to the board and a worker thread that accepts the board's
//! trigger stream, validates its framing and sequence continuity, and
//! fans every trigger out to the two downstream sinks plus an optional
//! rotating calibration file.
//!
//! Host coupling is deliberately narrow: the host drives the three
//! commands (`configure`, `start`, `stop`), supplies an [`HsiSink`]
//! implementation, and polls [`CibBridge::info`] for monitoring.

pub mod calibration;
pub mod control;
pub mod error;
pub mod module;
pub mod monitoring;
mod receiver;
pub mod sink;

pub use error::{BridgeError, Result};
pub use module::CibBridge;
pub use monitoring::{BridgeStats, CibBridgeInfo};
pub use sink::{HsiSink, SinkError, TracingSink};
