//! Product merge-on-append
//!
//! Combines an archived product with newly decoded rows of the same kind so
//! that no sample appears twice. Inputs are never mutated.
//!
//! Conflicting rows with the same identity key resolve as first occurrence
//! wins, existing before incoming. Merge is therefore not commutative when
//! two sources disagree about the same timestamp; it only has to be
//! idempotent and stable under append-only ingestion order.

use super::kinds::{ControlKeyPolicy, ProductKind};
use crate::types::{ControlRow, DataRow, Product, ProductError, ProductIdentity};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Samples closer than this (seconds) share a temporal key.
pub const TIME_EPSILON: f64 = 1e-6;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("cannot merge {incoming} into {existing}: different product kinds")]
    KindMismatch {
        existing: ProductIdentity,
        incoming: ProductIdentity,
    },

    #[error("packet of control row {index} declares {declared} bytes but holds {actual}")]
    LengthMismatch {
        index: u32,
        declared: usize,
        actual: usize,
    },

    #[error(transparent)]
    Product(#[from] ProductError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ControlKey {
    Time(u32, u16),
    TimeSequence(u32, u16, Option<u16>),
    TimeRequest(u32, u16, Option<u32>),
}

/// Merges products of one kind.
#[derive(Debug, Clone, Copy)]
pub struct ProductMerger {
    policy: ControlKeyPolicy,
}

impl ProductMerger {
    pub fn new(policy: ControlKeyPolicy) -> Self {
        Self { policy }
    }

    pub fn for_kind(kind: ProductKind) -> Self {
        Self::new(kind.control_key_policy())
    }

    /// Merge `incoming` into `existing`.
    pub fn merge(&self, existing: &Product, incoming: &Product) -> Result<Product, MergeError> {
        if existing.identity != incoming.identity {
            return Err(MergeError::KindMismatch {
                existing: existing.identity.clone(),
                incoming: incoming.identity.clone(),
            });
        }
        check_packet_lengths(existing)?;
        check_packet_lengths(incoming)?;

        let offset = existing
            .control()
            .iter()
            .map(|r| r.index)
            .max()
            .map_or(0, |max| max + 1);

        let shifted_control = incoming.control().iter().map(|row| {
            let mut row = row.clone();
            row.index += offset;
            row
        });
        let shifted_data = incoming.data().iter().map(|sample| {
            let mut sample = sample.clone();
            sample.control_index += offset;
            sample
        });

        // Control rows: first occurrence of each identity key survives, later
        // duplicates are redirected to it.
        let mut survivors: Vec<ControlRow> = Vec::with_capacity(existing.control().len());
        let mut by_key: HashMap<ControlKey, u32> = HashMap::new();
        let mut redirect: HashMap<u32, u32> = HashMap::new();
        for row in existing.control().iter().cloned().chain(shifted_control) {
            let key = self.control_key(&row);
            match by_key.get(&key) {
                Some(&kept) => {
                    redirect.insert(row.index, kept);
                }
                None => {
                    by_key.insert(key, row.index);
                    redirect.insert(row.index, row.index);
                    survivors.push(row);
                }
            }
        }
        let discriminator_of: HashMap<u32, Option<u32>> = survivors
            .iter()
            .map(|r| (r.index, self.discriminator(r)))
            .collect();

        // Data rows: deduplicate by sample time plus the row discriminator
        // (packet sequence count for level binary, request id for science).
        let mut seen: HashSet<(Option<u32>, i64)> = HashSet::new();
        let mut samples: Vec<DataRow> = Vec::with_capacity(existing.data().len());
        for mut sample in existing.data().iter().cloned().chain(shifted_data) {
            let Some(&control_index) = redirect.get(&sample.control_index) else {
                continue;
            };
            sample.control_index = control_index;
            let discriminator = discriminator_of.get(&control_index).copied().flatten();
            let bucket = (sample.time / TIME_EPSILON).round() as i64;
            let duplicate = (bucket - 1..=bucket + 1).any(|b| seen.contains(&(discriminator, b)));
            if duplicate {
                continue;
            }
            seen.insert((discriminator, bucket));
            samples.push(sample);
        }

        let mut idb_versions = existing.idb_versions().clone();
        for (version, range) in incoming.idb_versions() {
            idb_versions
                .entry(version.clone())
                .and_modify(|r| r.expand(*range))
                .or_insert(*range);
        }

        debug!(
            product = %existing.identity,
            existing_rows = existing.data().len(),
            incoming_rows = incoming.data().len(),
            merged_rows = samples.len(),
            "Merged product"
        );
        Ok(Product::new(
            existing.identity.clone(),
            survivors,
            samples,
            idb_versions,
        )?)
    }

    fn discriminator(&self, row: &ControlRow) -> Option<u32> {
        match self.policy {
            ControlKeyPolicy::TimeOnly => None,
            ControlKeyPolicy::TimeAndSequence => row.sequence_count.map(u32::from),
            ControlKeyPolicy::TimeAndRequest => row.request_id,
        }
    }

    fn control_key(&self, row: &ControlRow) -> ControlKey {
        match self.policy {
            ControlKeyPolicy::TimeOnly => ControlKey::Time(row.scet_coarse, row.scet_fine),
            ControlKeyPolicy::TimeAndSequence => {
                ControlKey::TimeSequence(row.scet_coarse, row.scet_fine, row.sequence_count)
            }
            ControlKeyPolicy::TimeAndRequest => {
                ControlKey::TimeRequest(row.scet_coarse, row.scet_fine, row.request_id)
            }
        }
    }
}

/// Every raw packet must be exactly `data_length + 7` bytes long.
fn check_packet_lengths(product: &Product) -> Result<(), MergeError> {
    let declared: BTreeMap<u32, u16> = product
        .control()
        .iter()
        .filter_map(|r| r.data_length.map(|len| (r.index, len)))
        .collect();
    for sample in product.data() {
        if let (Some(packet), Some(&length)) = (&sample.packet, declared.get(&sample.control_index)) {
            let expected = usize::from(length) + 7;
            if packet.len() != expected {
                return Err(MergeError::LengthMismatch {
                    index: sample.control_index,
                    declared: expected,
                    actual: packet.len(),
                });
            }
        }
    }
    Ok(())
}
