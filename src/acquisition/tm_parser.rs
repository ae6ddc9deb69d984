//! Raw Telemetry File Parser
//!
//! A raw telemetry file is a plain concatenation of CCSDS source packets.
//! Each packet carries a 6-byte primary header followed by the 10-byte PUS
//! TM data field header:
//!
//! ```text
//! primary:  version:3 type:1 header_flag:1 process_id:7 category:4
//!           sequence_flag:2 sequence_count:14 data_length:16
//! data hdr: spare:1 pus_version:3 spare:4 service_type:8 service_subtype:8
//!           destination_id:8 scet_coarse:32 scet_fine:16
//! ```
//!
//! Total packet length is `data_length + 7`. For services 3 and 21 the first
//! payload byte is the structure id (SSID).
//!
//! Malformed packets are reported with file and offset and skipped; parsing
//! resumes at the next declared packet boundary.

use crate::types::{
    PacketKey, Provenance, SCETime, SequenceFlag, TelemetryPacket, DATA_HEADER_LEN, HEADER_LEN,
    PRIMARY_HEADER_LEN,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Packet decoding errors
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("malformed packet in {file} at byte {offset}: {reason}")]
    MalformedPacket {
        file: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// Result of parsing one raw file: the good packets plus every malformed one.
#[derive(Debug, Default)]
pub struct ParsedFile {
    pub packets: Vec<TelemetryPacket>,
    pub malformed: Vec<PacketError>,
}

/// Read and parse a raw telemetry file.
pub fn parse_file(path: &Path) -> Result<ParsedFile, PacketError> {
    let bytes = std::fs::read(path).map_err(|e| PacketError::Io(path.to_path_buf(), e))?;
    Ok(parse_bytes(&bytes, path))
}

/// Parse an in-memory packet stream, attributing packets to `source`.
pub fn parse_bytes(bytes: &[u8], source: &Path) -> ParsedFile {
    let source_file = Arc::new(source.to_path_buf());
    let mut parsed = ParsedFile::default();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let malformed = |reason: String| PacketError::MalformedPacket {
            file: source.to_path_buf(),
            offset: offset as u64,
            reason,
        };

        let remaining = &bytes[offset..];
        if remaining.len() < PRIMARY_HEADER_LEN {
            let err = malformed(format!("{} trailing bytes, shorter than a header", remaining.len()));
            warn!(file = %source.display(), offset, "{}", err);
            parsed.malformed.push(err);
            break;
        }

        let data_length = u16::from_be_bytes([remaining[4], remaining[5]]);
        let total = usize::from(data_length) + 7;
        if total > remaining.len() {
            let err = malformed(format!(
                "declared length {} overruns the file ({} bytes left)",
                total,
                remaining.len()
            ));
            warn!(file = %source.display(), offset, "{}", err);
            parsed.malformed.push(err);
            break;
        }

        let provenance = Provenance {
            source_file: Arc::clone(&source_file),
            offset: offset as u64,
        };
        match decode_packet(&remaining[..total], provenance) {
            Ok(packet) => parsed.packets.push(packet),
            Err(reason) => {
                let err = malformed(reason);
                warn!(file = %source.display(), offset, "{}", err);
                parsed.malformed.push(err);
            }
        }
        offset += total;
    }

    debug!(
        file = %source.display(),
        packets = parsed.packets.len(),
        malformed = parsed.malformed.len(),
        "Parsed raw telemetry"
    );
    parsed
}

/// Decode exactly one packet. `raw` must span the declared packet length.
fn decode_packet(raw: &[u8], provenance: Provenance) -> Result<TelemetryPacket, String> {
    let version = raw[0] >> 5;
    if version != 0 {
        return Err(format!("unsupported packet version {}", version));
    }
    if raw.len() < HEADER_LEN {
        return Err(format!(
            "packet of {} bytes cannot hold the {}-byte data header",
            raw.len(),
            DATA_HEADER_LEN
        ));
    }

    let sequence_word = u16::from_be_bytes([raw[2], raw[3]]);
    let sequence_flag = SequenceFlag::from_bits((sequence_word >> 14) as u8);
    let sequence_count = sequence_word & 0x3FFF;
    let data_length = u16::from_be_bytes([raw[4], raw[5]]);

    let service_type = raw[7];
    let service_subtype = raw[8];
    let raw_coarse = u32::from_be_bytes([raw[10], raw[11], raw[12], raw[13]]);
    let fine = u16::from_be_bytes([raw[14], raw[15]]);

    let ssid = if PacketKey::service_has_ssid(service_type) {
        Some(
            *raw.get(HEADER_LEN)
                .ok_or_else(|| format!("service {} packet without a structure id", service_type))?,
        )
    } else {
        None
    };

    Ok(TelemetryPacket {
        key: PacketKey::new(service_type, service_subtype, ssid),
        sequence_flag,
        sequence_count,
        scet: SCETime::from_raw(raw_coarse, fine),
        data_length,
        raw: raw.to_vec(),
        provenance,
    })
}

/// Header fields for [`encode_packet`].
#[derive(Debug, Clone)]
pub struct PacketFields {
    pub key: PacketKey,
    pub sequence_flag: SequenceFlag,
    pub sequence_count: u16,
    /// Raw wire coarse value (top bit = desync marker)
    pub raw_coarse: u32,
    pub fine: u16,
    /// Application data after the SSID byte
    pub body: Vec<u8>,
}

/// Build the wire bytes of one packet. Used to replay and synthesize
/// telemetry streams.
pub fn encode_packet(fields: &PacketFields) -> Vec<u8> {
    let mut payload = Vec::with_capacity(fields.body.len() + 1);
    if let Some(ssid) = fields.key.ssid {
        payload.push(ssid);
    }
    payload.extend_from_slice(&fields.body);

    let total = HEADER_LEN + payload.len();
    let data_length = (total - 7) as u16;

    let mut raw = Vec::with_capacity(total);
    // version 0, type TM, secondary header present, process id 91, category 12
    raw.extend_from_slice(&[0x0D, 0xBC]);
    let sequence_word = (u16::from(fields.sequence_flag.bits()) << 14) | (fields.sequence_count & 0x3FFF);
    raw.extend_from_slice(&sequence_word.to_be_bytes());
    raw.extend_from_slice(&data_length.to_be_bytes());
    raw.push(0x10); // pus version 1
    raw.push(fields.key.service_type);
    raw.push(fields.key.service_subtype);
    raw.push(0); // destination
    raw.extend_from_slice(&fields.raw_coarse.to_be_bytes());
    raw.extend_from_slice(&fields.fine.to_be_bytes());
    raw.extend_from_slice(&payload);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(flag: SequenceFlag, count: u16, coarse: u32) -> PacketFields {
        PacketFields {
            key: PacketKey::new(21, 6, Some(21)),
            sequence_flag: flag,
            sequence_count: count,
            raw_coarse: coarse,
            fine: 100,
            body: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_decode_header_fields() {
        let raw = encode_packet(&fields(SequenceFlag::First, 77, 1000));
        let parsed = parse_bytes(&raw, Path::new("a.bin"));
        assert!(parsed.malformed.is_empty());
        let packet = &parsed.packets[0];
        assert_eq!(packet.key, PacketKey::new(21, 6, Some(21)));
        assert_eq!(packet.sequence_flag, SequenceFlag::First);
        assert_eq!(packet.sequence_count, 77);
        assert_eq!(packet.scet, SCETime::from_parts(1000, 100));
        assert_eq!(packet.declared_len(), raw.len());
        assert_eq!(packet.payload(), &[21, 1, 2, 3, 4]);
        assert_eq!(packet.provenance.offset, 0);
    }

    #[test]
    fn test_desync_marker() {
        let raw = encode_packet(&fields(SequenceFlag::Standalone, 1, 1000 | (1 << 31)));
        let parsed = parse_bytes(&raw, Path::new("a.bin"));
        assert!(!parsed.packets[0].scet.time_sync());
        assert_eq!(parsed.packets[0].scet.coarse(), 1000);
    }

    #[test]
    fn test_malformed_packet_skipped_with_offset() {
        let first = encode_packet(&fields(SequenceFlag::Standalone, 1, 10));
        let mut bad = encode_packet(&fields(SequenceFlag::Standalone, 2, 11));
        bad[0] |= 0b0110_0000; // version 3
        let third = encode_packet(&fields(SequenceFlag::Standalone, 3, 12));

        let mut stream = first.clone();
        stream.extend_from_slice(&bad);
        stream.extend_from_slice(&third);

        let parsed = parse_bytes(&stream, Path::new("mixed.bin"));
        assert_eq!(parsed.packets.len(), 2);
        assert_eq!(parsed.packets[1].provenance.offset, (first.len() + bad.len()) as u64);
        match &parsed.malformed[..] {
            [PacketError::MalformedPacket { offset, file, .. }] => {
                assert_eq!(*offset, first.len() as u64);
                assert_eq!(file, Path::new("mixed.bin"));
            }
            other => panic!("unexpected errors: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_tail_reported() {
        let mut stream = encode_packet(&fields(SequenceFlag::Standalone, 1, 10));
        let second = encode_packet(&fields(SequenceFlag::Standalone, 2, 10));
        stream.extend_from_slice(&second[..second.len() - 3]);

        let parsed = parse_bytes(&stream, Path::new("cut.bin"));
        assert_eq!(parsed.packets.len(), 1);
        assert_eq!(parsed.malformed.len(), 1);
    }

    #[test]
    fn test_service_without_ssid() {
        let raw = encode_packet(&PacketFields {
            key: PacketKey::new(1, 7, None),
            sequence_flag: SequenceFlag::Standalone,
            sequence_count: 0,
            raw_coarse: 5,
            fine: 0,
            body: vec![9, 9],
        });
        let parsed = parse_bytes(&raw, Path::new("ack.bin"));
        assert_eq!(parsed.packets[0].key.ssid, None);
    }
}
