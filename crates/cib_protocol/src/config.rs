//! Bridge configuration decoded from the `conf` command document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Configuration accepted by `conf`; immutable once applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conf {
    /// Control endpoint of the board.
    pub cib_host: String,
    pub cib_port: u16,
    /// Index of this instance's trigger bit, in 0..=31.
    pub cib_trigger_bit: u8,
    /// Opaque instance tag; echoed in logs only.
    pub cib_instance: u32,
    /// Desired inbound listener port; bumped upward if occupied.
    pub receiver_port: u16,
    /// Poll granularity for accept and cancellation checks, in
    /// microseconds.
    pub receiver_timeout_us: u64,
    #[serde(default)]
    pub calibration: CalibrationConf,
    /// Board configuration fragment, forwarded verbatim inside the
    /// `config` command.
    pub board_config: Value,
}

/// Calibration stream settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationConf {
    pub enabled: bool,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub rotation_minutes: u64,
}

impl Conf {
    /// Validate cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.cib_trigger_bit > 31 {
            return Err(ProtocolError::InvalidTriggerBit(self.cib_trigger_bit));
        }
        Ok(())
    }

    /// One-hot 32-bit mask identifying this instance's logical channel.
    pub fn trigger_bit(&self) -> u32 {
        1u32 << self.cib_trigger_bit
    }

    pub fn receiver_timeout(&self) -> Duration {
        Duration::from_micros(self.receiver_timeout_us)
    }
}
