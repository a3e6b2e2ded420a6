//! Downstream sink seam
//!
//! The DAQ host hands the bridge two typed senders; everything the
//! bridge needs from them fits behind one narrow trait, so the core can
//! be exercised without the host.

use cib_protocol::{HsiEvent, RawFrame};
use thiserror::Error;
use tracing::debug;

/// A downstream consumer rejected a record.
#[derive(Error, Debug)]
#[error("Downstream sink rejected {what}: {reason}")]
pub struct SinkError {
    pub what: &'static str,
    pub reason: String,
}

impl SinkError {
    pub fn new(what: &'static str, reason: impl Into<String>) -> Self {
        Self {
            what,
            reason: reason.into(),
        }
    }
}

/// Send contract of the two downstream consumers.
///
/// For every accepted trigger the receiver offers exactly one raw frame
/// and then exactly one event, in that order.
pub trait HsiSink: Send + Sync {
    fn send_raw_frame(&self, frame: &RawFrame) -> Result<(), SinkError>;
    fn send_event(&self, event: &HsiEvent) -> Result<(), SinkError>;
}

/// Sink that logs every record; stands in for the DAQ fabric when the
/// bridge runs standalone.
#[derive(Debug, Default)]
pub struct TracingSink;

impl HsiSink for TracingSink {
    fn send_raw_frame(&self, frame: &RawFrame) -> Result<(), SinkError> {
        debug!(words = ?frame.words(), "Formed raw HSI frame");
        Ok(())
    }

    fn send_event(&self, event: &HsiEvent) -> Result<(), SinkError> {
        debug!(
            timestamp = event.timestamp,
            counter = event.counter,
            run = event.run,
            "HSI event"
        );
        Ok(())
    }
}
