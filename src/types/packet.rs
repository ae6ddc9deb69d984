//! Telemetry packet model
//!
//! A packet as seen by the rest of the pipeline: its identity key, its
//! position in a logical sequence, the onboard time, and the raw bytes it
//! was decoded from (kept so that level binary products can be rebuilt
//! byte-for-byte).

use super::time::SCETime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Length of the CCSDS primary header.
pub const PRIMARY_HEADER_LEN: usize = 6;

/// Length of the PUS TM data field header that follows the primary header.
pub const DATA_HEADER_LEN: usize = 10;

/// Bytes preceding the application payload.
pub const HEADER_LEN: usize = PRIMARY_HEADER_LEN + DATA_HEADER_LEN;

/// Sequence counts wrap at 14 bits.
pub const SEQUENCE_COUNT_MODULUS: u32 = 1 << 14;

/// Position of a packet within a logical unit (2-bit wire field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SequenceFlag {
    Middle,
    First,
    Last,
    Standalone,
}

impl SequenceFlag {
    /// Decode the 2-bit wire value. Only the low two bits are considered.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Middle,
            1 => Self::First,
            2 => Self::Last,
            _ => Self::Standalone,
        }
    }

    pub const fn bits(self) -> u8 {
        match self {
            Self::Middle => 0,
            Self::First => 1,
            Self::Last => 2,
            Self::Standalone => 3,
        }
    }
}

impl fmt::Display for SequenceFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Middle => "MIDDLE",
            Self::First => "FIRST",
            Self::Last => "LAST",
            Self::Standalone => "STANDALONE",
        };
        f.write_str(name)
    }
}

/// `(service_type, service_subtype, ssid)` identity shared by all packets of
/// one product kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketKey {
    pub service_type: u8,
    pub service_subtype: u8,
    pub ssid: Option<u8>,
}

impl PacketKey {
    pub const fn new(service_type: u8, service_subtype: u8, ssid: Option<u8>) -> Self {
        Self {
            service_type,
            service_subtype,
            ssid,
        }
    }

    /// Services whose first payload byte is a structure id.
    pub const fn service_has_ssid(service_type: u8) -> bool {
        matches!(service_type, 3 | 21)
    }
}

impl fmt::Display for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ssid {
            Some(ssid) => write!(f, "{}-{}-{}", self.service_type, self.service_subtype, ssid),
            None => write!(f, "{}-{}", self.service_type, self.service_subtype),
        }
    }
}

/// Where a packet came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub source_file: Arc<PathBuf>,
    /// Byte offset of the packet's first header byte.
    pub offset: u64,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source_file.display(), self.offset)
    }
}

/// One decoded telemetry packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryPacket {
    pub key: PacketKey,
    pub sequence_flag: SequenceFlag,
    /// 14-bit source sequence count
    pub sequence_count: u16,
    pub scet: SCETime,
    /// Declared packet data length (wire value, total length minus 7)
    pub data_length: u16,
    /// Complete packet bytes, headers included
    pub raw: Vec<u8>,
    pub provenance: Provenance,
}

impl TelemetryPacket {
    /// Application data following both headers.
    pub fn payload(&self) -> &[u8] {
        self.raw.get(HEADER_LEN..).unwrap_or(&[])
    }

    /// Total packet length implied by the header.
    pub fn declared_len(&self) -> usize {
        usize::from(self.data_length) + 7
    }

    /// Whether `next` directly follows this packet in the 14-bit count space.
    pub fn is_followed_by(&self, next: &TelemetryPacket) -> bool {
        (u32::from(self.sequence_count) + 1) % SEQUENCE_COUNT_MODULUS
            == u32::from(next.sequence_count)
    }
}

/// Reconstructed logical unit, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSequence {
    pub packets: Vec<TelemetryPacket>,
    pub status: SequenceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceStatus {
    Complete,
    Incomplete,
}

impl PacketSequence {
    pub fn key(&self) -> Option<PacketKey> {
        self.packets.first().map(|p| p.key)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.status == SequenceStatus::Complete
    }
}
