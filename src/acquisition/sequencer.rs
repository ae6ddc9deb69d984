//! Packet Sequencer
//!
//! Reassembles an ordered packet stream into logical sequences. State is
//! kept independently per packet key:
//!
//! | flag       | Idle                         | Open                                  |
//! |------------|------------------------------|---------------------------------------|
//! | STANDALONE | emit Complete(1)             | emit Complete(1), Open untouched      |
//! | FIRST      | Open                         | flush Incomplete, Open                |
//! | MIDDLE     | Open (started mid-stream)    | append                                |
//! | LAST       | emit Incomplete(1)           | append, emit, Idle                    |
//!
//! A sequence closed by LAST is Complete only if it began with FIRST and its
//! sequence counts are contiguous. Kinds that bypass sequencing emit every
//! packet as its own Complete sequence.

use crate::types::{PacketKey, PacketSequence, SequenceFlag, SequenceStatus, TelemetryPacket};
use std::collections::BTreeMap;
use tracing::warn;

/// Sequences produced from one packet stream.
#[derive(Debug, Default)]
pub struct SequencerOutput {
    /// Ready for decoding
    pub complete: Vec<PacketSequence>,
    /// Retained for diagnostics, never merged into complete output
    pub incomplete: Vec<PacketSequence>,
}

/// Reassembly state machine.
///
/// `bypass` decides which keys skip reassembly; it is normally
/// [`crate::products::KindRegistry::bypasses_sequencing`].
pub struct PacketSequencer<F> {
    open: BTreeMap<PacketKey, Vec<TelemetryPacket>>,
    output: SequencerOutput,
    bypass: F,
}

impl<F> PacketSequencer<F>
where
    F: Fn(&PacketKey) -> bool,
{
    pub fn new(bypass: F) -> Self {
        Self {
            open: BTreeMap::new(),
            output: SequencerOutput::default(),
            bypass,
        }
    }

    /// Feed packets in arrival order.
    pub fn push_all<I>(&mut self, packets: I)
    where
        I: IntoIterator<Item = TelemetryPacket>,
    {
        for packet in packets {
            self.push(packet);
        }
    }

    pub fn push(&mut self, packet: TelemetryPacket) {
        if (self.bypass)(&packet.key) {
            self.emit(vec![packet], SequenceStatus::Complete);
            return;
        }

        match packet.sequence_flag {
            SequenceFlag::Standalone => self.emit(vec![packet], SequenceStatus::Complete),
            SequenceFlag::First => {
                if let Some(stale) = self.open.remove(&packet.key) {
                    warn!(
                        key = %packet.key,
                        packets = stale.len(),
                        at = %packet.provenance,
                        "FIRST without matching LAST, flushing open sequence as incomplete"
                    );
                    self.emit(stale, SequenceStatus::Incomplete);
                }
                self.open.insert(packet.key, vec![packet]);
            }
            SequenceFlag::Middle => match self.open.get_mut(&packet.key) {
                Some(sequence) => sequence.push(packet),
                None => {
                    warn!(
                        key = %packet.key,
                        count = packet.sequence_count,
                        at = %packet.provenance,
                        "Sequence started mid-stream"
                    );
                    self.open.insert(packet.key, vec![packet]);
                }
            },
            SequenceFlag::Last => match self.open.remove(&packet.key) {
                Some(mut sequence) => {
                    sequence.push(packet);
                    let status = closed_status(&sequence);
                    self.emit(sequence, status);
                }
                None => {
                    warn!(
                        key = %packet.key,
                        count = packet.sequence_count,
                        at = %packet.provenance,
                        "LAST without FIRST"
                    );
                    self.emit(vec![packet], SequenceStatus::Incomplete);
                }
            },
        }
    }

    /// Number of keys with an open sequence.
    pub fn open_sequences(&self) -> usize {
        self.open.len()
    }

    /// Flush every still-open sequence as incomplete and return the result.
    pub fn into_output(mut self) -> SequencerOutput {
        let open = std::mem::take(&mut self.open);
        for (key, sequence) in open {
            warn!(key = %key, packets = sequence.len(), "Stream ended inside an open sequence");
            self.emit(sequence, SequenceStatus::Incomplete);
        }
        self.output
    }

    fn emit(&mut self, packets: Vec<TelemetryPacket>, status: SequenceStatus) {
        let sequence = PacketSequence { packets, status };
        match status {
            SequenceStatus::Complete => self.output.complete.push(sequence),
            SequenceStatus::Incomplete => self.output.incomplete.push(sequence),
        }
    }
}

/// Status of a sequence just closed by LAST.
fn closed_status(sequence: &[TelemetryPacket]) -> SequenceStatus {
    let began_with_first = sequence
        .first()
        .map(|p| p.sequence_flag == SequenceFlag::First)
        .unwrap_or(false);
    if !began_with_first {
        return SequenceStatus::Incomplete;
    }

    if let Some(gap) = sequence.windows(2).find(|pair| !pair[0].is_followed_by(&pair[1])) {
        warn!(
            key = %gap[0].key,
            from = gap[0].sequence_count,
            to = gap[1].sequence_count,
            "Sequence count gap, sequence incomplete"
        );
        return SequenceStatus::Incomplete;
    }
    SequenceStatus::Complete
}

/// Run a whole packet stream through a fresh sequencer.
pub fn sequence_packets<F>(packets: Vec<TelemetryPacket>, bypass: F) -> SequencerOutput
where
    F: Fn(&PacketKey) -> bool,
{
    let mut sequencer = PacketSequencer::new(bypass);
    sequencer.push_all(packets);
    sequencer.into_output()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Provenance, SCETime};
    use std::path::PathBuf;
    use std::sync::Arc;

    const SCI: PacketKey = PacketKey::new(21, 6, Some(21));
    const HK: PacketKey = PacketKey::new(3, 25, Some(1));

    fn packet(key: PacketKey, flag: SequenceFlag, count: u16) -> TelemetryPacket {
        TelemetryPacket {
            key,
            sequence_flag: flag,
            sequence_count: count,
            scet: SCETime::from_parts(100 + u32::from(count), 0),
            data_length: 9,
            raw: vec![0; 17],
            provenance: Provenance {
                source_file: Arc::new(PathBuf::from("test.bin")),
                offset: u64::from(count),
            },
        }
    }

    fn run(packets: Vec<TelemetryPacket>) -> SequencerOutput {
        sequence_packets(packets, |key| *key == HK)
    }

    use SequenceFlag::{First, Last, Middle, Standalone};

    #[test]
    fn test_full_sequence_complete() {
        let out = run(vec![
            packet(SCI, First, 1),
            packet(SCI, Middle, 2),
            packet(SCI, Middle, 3),
            packet(SCI, Last, 4),
        ]);
        assert_eq!(out.complete.len(), 1);
        assert_eq!(out.complete[0].len(), 4);
        assert!(out.incomplete.is_empty());
    }

    #[test]
    fn test_missing_last_is_incomplete() {
        let out = run(vec![packet(SCI, First, 1), packet(SCI, Middle, 2)]);
        assert!(out.complete.is_empty());
        assert_eq!(out.incomplete.len(), 1);
        assert_eq!(out.incomplete[0].len(), 2);
    }

    #[test]
    fn test_standalone_does_not_disturb_open_sequence() {
        let out = run(vec![
            packet(SCI, First, 1),
            packet(SCI, Standalone, 2),
            packet(SCI, Last, 3),
        ]);
        // The standalone packet took count 2, so the FIRST/LAST pair has a gap.
        assert_eq!(out.complete.len(), 1);
        assert_eq!(out.complete[0].len(), 1);
        assert_eq!(out.incomplete.len(), 1);
        assert_eq!(out.incomplete[0].len(), 2);
    }

    #[test]
    fn test_first_flushes_open_sequence() {
        let out = run(vec![
            packet(SCI, First, 1),
            packet(SCI, Middle, 2),
            packet(SCI, First, 3),
            packet(SCI, Last, 4),
        ]);
        assert_eq!(out.incomplete.len(), 1);
        assert_eq!(out.incomplete[0].len(), 2);
        assert_eq!(out.complete.len(), 1);
        assert_eq!(out.complete[0].packets[0].sequence_count, 3);
    }

    #[test]
    fn test_middle_without_first_then_last() {
        let out = run(vec![packet(SCI, Middle, 5), packet(SCI, Last, 6)]);
        assert!(out.complete.is_empty());
        assert_eq!(out.incomplete.len(), 1);
        assert_eq!(out.incomplete[0].len(), 2);
    }

    #[test]
    fn test_last_without_open_sequence() {
        let out = run(vec![packet(SCI, Last, 9)]);
        assert!(out.complete.is_empty());
        assert_eq!(out.incomplete.len(), 1);
        assert_eq!(out.incomplete[0].len(), 1);
    }

    #[test]
    fn test_count_wrap_is_contiguous() {
        let out = run(vec![packet(SCI, First, 16383), packet(SCI, Last, 0)]);
        assert_eq!(out.complete.len(), 1);
    }

    #[test]
    fn test_bypass_kinds_always_complete() {
        let out = run(vec![
            packet(HK, First, 1),
            packet(HK, Middle, 2),
            packet(HK, Middle, 7),
        ]);
        assert_eq!(out.complete.len(), 3);
        assert!(out.incomplete.is_empty());
    }

    #[test]
    fn test_keys_are_independent() {
        let other = PacketKey::new(21, 6, Some(24));
        let out = run(vec![
            packet(SCI, First, 1),
            packet(other, First, 10),
            packet(SCI, Last, 2),
            packet(other, Last, 11),
        ]);
        assert_eq!(out.complete.len(), 2);
        assert!(out.incomplete.is_empty());
    }
}
