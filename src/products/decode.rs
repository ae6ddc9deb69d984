//! Packet decoders
//!
//! Decoding packets into a product is a per-kind collaborator. The built-in
//! level binary decoder keeps every packet verbatim, one control and one data
//! row per packet; calibrated kinds register their own decoders.

use super::kinds::ProductKind;
use crate::types::{
    ControlRow, DataRow, PacketSequence, Product, ProductError, ProductLevel, SCETimeRange,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("no decoder registered for {0} at level {1}")]
    NoDecoder(ProductKind, ProductLevel),

    #[error("nothing to decode for {0}")]
    NoPackets(ProductKind),

    #[error("decoder for {kind} failed: {message}")]
    Collaborator { kind: ProductKind, message: String },

    #[error(transparent)]
    Product(#[from] ProductError),
}

/// `(raw packets) -> Product` for one kind.
pub trait PacketDecoder: Send + Sync {
    fn level(&self) -> ProductLevel;

    fn decode(&self, kind: ProductKind, sequences: &[PacketSequence]) -> Result<Product, DecodeError>;
}

/// Level binary: packets kept as raw bytes.
#[derive(Debug, Clone)]
pub struct LevelBinaryDecoder {
    /// Decode-table version recorded for the decoded time range
    pub idb_version: String,
}

impl Default for LevelBinaryDecoder {
    fn default() -> Self {
        Self {
            idb_version: "raw".to_string(),
        }
    }
}

impl PacketDecoder for LevelBinaryDecoder {
    fn level(&self) -> ProductLevel {
        ProductLevel::LB
    }

    fn decode(&self, kind: ProductKind, sequences: &[PacketSequence]) -> Result<Product, DecodeError> {
        let first = sequences
            .iter()
            .flat_map(|s| s.packets.first())
            .next()
            .ok_or(DecodeError::NoPackets(kind))?;
        let identity = kind.identity(first.key, ProductLevel::LB);

        let mut control = Vec::new();
        let mut data = Vec::new();
        let mut range = SCETimeRange::instant(first.scet);
        for packet in sequences.iter().flat_map(|s| &s.packets) {
            let index = control.len() as u32;
            range.expand(packet.scet);
            control.push(ControlRow {
                index,
                scet_coarse: packet.scet.coarse(),
                scet_fine: packet.scet.fine(),
                sequence_count: Some(packet.sequence_count),
                request_id: None,
                data_length: Some(packet.data_length),
                integration_time: 0.0,
                raw_file: packet
                    .provenance
                    .source_file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            });
            data.push(DataRow {
                control_index: index,
                time: packet.scet.as_float(),
                timedel: 0.0,
                counts: Vec::new(),
                packet: Some(packet.raw.clone()),
            });
        }

        let mut idb_versions = BTreeMap::new();
        idb_versions.insert(self.idb_version.clone(), range);
        Ok(Product::new(identity, control, data, idb_versions)?)
    }
}

/// Decoders by `(kind, level)`.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<(ProductKind, ProductLevel), Arc<dyn PacketDecoder>>,
}

impl DecoderRegistry {
    /// Registry with the level binary decoder installed.
    pub fn with_level_binary() -> Self {
        let mut registry = Self::default();
        registry.register(ProductKind::LevelBinary, Arc::new(LevelBinaryDecoder::default()));
        registry
    }

    pub fn register(&mut self, kind: ProductKind, decoder: Arc<dyn PacketDecoder>) {
        self.decoders.insert((kind, decoder.level()), decoder);
    }

    pub fn decode(
        &self,
        kind: ProductKind,
        level: ProductLevel,
        sequences: &[PacketSequence],
    ) -> Result<Product, DecodeError> {
        self.decoders
            .get(&(kind, level))
            .ok_or(DecodeError::NoDecoder(kind, level))?
            .decode(kind, sequences)
    }
}
