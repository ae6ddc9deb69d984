//! Telemetry acquisition
//!
//! Turns raw downlinked telemetry files into packets and packets into
//! logical sequences ready for decoding.

pub mod sequencer;
pub mod tm_parser;

pub use sequencer::{sequence_packets, PacketSequencer, SequencerOutput};
pub use tm_parser::{encode_packet, parse_bytes, parse_file, PacketError, PacketFields, ParsedFile};
