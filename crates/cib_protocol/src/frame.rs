//! Downstream artifacts built from each trigger
//!
//! Every accepted trigger word becomes two records: a bit-exact 7-word
//! raw frame for the low-level data-link handlers, and a logical event
//! for the trigger decision path.

use serde::{Deserialize, Serialize};

use crate::wire::TriggerWord;

/// Word 0 of every raw frame: frame version 1, detector id 1, link 1,
/// slot and crate 0.
pub const DAQ_HEADER_WORD: u32 = (1 << 26) | (1 << 6) | 1;

/// The 7 x 32-bit frame consumed by the downstream data-link handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame(pub [u32; 7]);

impl RawFrame {
    /// Assemble a frame from a trigger word.
    ///
    /// `trigger_bit` is the one-hot channel mask of this bridge
    /// instance; `counter` is the 1-based per-run trigger count. Words
    /// 3 and 4 stay addressable for the firmware's planned direction
    /// encoding but are zero until it lands.
    pub fn from_trigger(word: &TriggerWord, trigger_bit: u32, counter: u32) -> Self {
        Self([
            DAQ_HEADER_WORD,
            (word.timestamp & 0xFFFF_FFFF) as u32,
            (word.timestamp >> 32) as u32,
            0,
            0,
            trigger_bit,
            counter,
        ])
    }

    pub fn words(&self) -> &[u32; 7] {
        &self.0
    }
}

/// The logical event record handed to the trigger decision path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsiEvent {
    pub device_id: u32,
    /// One-hot channel mask of the originating bridge instance.
    pub signal_map: u32,
    pub timestamp: u64,
    /// 1-based per-run trigger count.
    pub counter: u32,
    pub run: u32,
}

impl HsiEvent {
    /// Device id of the CIB channel.
    pub const DEVICE_ID: u32 = 1;

    pub fn from_trigger(word: &TriggerWord, trigger_bit: u32, counter: u32, run: u32) -> Self {
        Self {
            device_id: Self::DEVICE_ID,
            signal_map: trigger_bit,
            timestamp: word.timestamp,
            counter,
            run,
        }
    }
}
