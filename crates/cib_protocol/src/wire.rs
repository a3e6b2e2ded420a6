//! Binary trigger stream codec
//!
//! Each packet on the inbound socket is a packed header followed by the
//! payload it announces. Current firmware always sends exactly one
//! trigger word per packet.
//!
//! Header format (4 bytes, little endian, matching the packed firmware
//! struct):
//! ```text
//! [SEQ:1][RES:1][SIZE:2]
//! ```
//!
//! - SEQ (u8): packet sequence id, monotone modulo 256
//! - RES (u8): firmware padding, consumed and ignored
//! - SIZE (u16): payload size in bytes
//!
//! Trigger word format (16 bytes, little endian):
//! ```text
//! [TIMESTAMP:8][ADDITIONAL:8]
//! ```
//!
//! ADDITIONAL is reserved by the firmware (direction encoding is on its
//! roadmap) and currently opaque to the bridge.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{ProtocolError, Result};

/// Packet header prefixed to every inbound transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub sequence_id: u8,
    pub packet_size: u16,
}

impl TcpHeader {
    /// Header size on the wire in bytes.
    pub const SIZE: usize = 4;

    /// Pack the header into its 4-byte wire form.
    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.sequence_id;
        buf[2..4].copy_from_slice(&self.packet_size.to_le_bytes());
        buf
    }

    /// Unpack a header from its 4-byte wire form.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::TruncatedPacket {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        let mut cursor = Cursor::new(&data[..Self::SIZE]);
        let sequence_id = cursor.read_u8()?;
        let _reserved = cursor.read_u8()?;
        let packet_size = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            sequence_id,
            packet_size,
        })
    }

    /// Unpack from an exactly-sized buffer; cannot fail.
    pub fn from_bytes(buf: [u8; Self::SIZE]) -> Self {
        Self {
            sequence_id: buf[0],
            packet_size: u16::from_le_bytes([buf[2], buf[3]]),
        }
    }

    /// Number of trigger words the payload claims to carry.
    ///
    /// Anything other than 1 is a firmware anomaly; the caller decides
    /// how loudly to complain.
    pub fn word_count(&self) -> usize {
        self.packet_size as usize / TriggerWord::SIZE
    }
}

/// One trigger record as emitted by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerWord {
    /// Monotonic hardware time of the trigger.
    pub timestamp: u64,
    /// Reserved by the firmware; forwarded as opaque bits.
    pub additional: u64,
}

impl TriggerWord {
    /// Trigger word size on the wire in bytes.
    pub const SIZE: usize = 16;

    /// Pack the word into its 16-byte wire form.
    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..].copy_from_slice(&self.additional.to_le_bytes());
        buf
    }

    /// Unpack a word from its 16-byte wire form.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::TruncatedPacket {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        let mut cursor = Cursor::new(&data[..Self::SIZE]);
        let timestamp = cursor.read_u64::<LittleEndian>()?;
        let additional = cursor.read_u64::<LittleEndian>()?;
        Ok(Self {
            timestamp,
            additional,
        })
    }

    /// Unpack from an exactly-sized buffer; cannot fail.
    pub fn from_bytes(buf: [u8; Self::SIZE]) -> Self {
        let mut timestamp = [0u8; 8];
        let mut additional = [0u8; 8];
        timestamp.copy_from_slice(&buf[..8]);
        additional.copy_from_slice(&buf[8..]);
        Self {
            timestamp: u64::from_le_bytes(timestamp),
            additional: u64::from_le_bytes(additional),
        }
    }
}

/// A reported discontinuity in the packet sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// Last id seen before the gap; `None` on the very first packet.
    pub prev: Option<u8>,
    pub current: u8,
}

/// Tracks sequence-id continuity across the inbound stream.
///
/// The id is a u8 that must increment modulo 256; the first packet of a
/// connection must carry id 0. Violations are reported, never fatal,
/// and the tracker resynchronizes on the offending id.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    prev: Option<u8>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `current` and report a gap if continuity was broken.
    pub fn check(&mut self, current: u8) -> Option<SequenceGap> {
        let gap = match self.prev {
            None if current == 0 => None,
            None => Some(SequenceGap {
                prev: None,
                current,
            }),
            Some(prev) if prev.wrapping_add(1) == current => None,
            Some(prev) => Some(SequenceGap {
                prev: Some(prev),
                current,
            }),
        };
        self.prev = Some(current);
        gap
    }
}
