//! Concrete processing steps
//!
//! - [`TelemetryIngestStep`]: raw telemetry file to level binary products
//! - [`LevelUpStep`]: archived product at level N to level N+1 through an
//!   external transform
//! - [`AspectStep`]: L1 housekeeping to the ancillary aspect product through
//!   the external aspect solver

use super::step::{ProcessingStep, StepError};
use crate::config::AspectConfig;
use crate::acquisition::{parse_file, sequence_packets};
use crate::products::{
    solve_in_batches, AspectSample, AspectSolver, DecoderRegistry, KindRegistry, ProductArchive, ProductKind,
};
use crate::storage::LedgerIdentity;
use crate::types::{DataRow, PacketKey, PacketSequence, Product, ProductFileName, ProductIdentity, ProductLevel};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Telemetry ingest
// ============================================================================

/// Raw telemetry to level binary.
///
/// Complete sequences are archived under regular names; incomplete ones are
/// kept under the `U` status marker. Sequences never span input files.
pub struct TelemetryIngestStep {
    archive: Arc<ProductArchive>,
    kinds: Arc<KindRegistry>,
    decoders: DecoderRegistry,
}

impl TelemetryIngestStep {
    pub const NAME: &'static str = "tm-ingest";

    pub fn new(archive: Arc<ProductArchive>, kinds: Arc<KindRegistry>, decoders: DecoderRegistry) -> Self {
        Self {
            archive,
            kinds,
            decoders,
        }
    }

    fn store_groups(
        &self,
        sequences: Vec<PacketSequence>,
        incomplete: bool,
        outputs: &mut Vec<PathBuf>,
    ) -> Result<(), StepError> {
        let mut by_key: BTreeMap<PacketKey, Vec<PacketSequence>> = BTreeMap::new();
        for sequence in sequences {
            if let Some(key) = sequence.key() {
                by_key.entry(key).or_default().push(sequence);
            }
        }
        for (key, group) in by_key {
            let kind = self
                .kinds
                .resolve(key, ProductLevel::LB)
                .ok_or_else(|| StepError::UnknownKind(key.to_string()))?;
            let product = self.decoders.decode(kind, ProductLevel::LB, &group)?;
            outputs.extend(self.archive.store(kind, &product, incomplete)?);
        }
        Ok(())
    }
}

impl ProcessingStep for TelemetryIngestStep {
    fn step_name(&self) -> &str {
        Self::NAME
    }

    fn identity(&self, _input: &Path) -> Option<LedgerIdentity> {
        Some(LedgerIdentity::new(Self::NAME, ProductLevel::LB, "tm", self.archive.version()))
    }

    fn batch_key(&self, _input: &Path) -> String {
        "tm".to_string()
    }

    /// Raw files can feed the same daily level binary file.
    fn splittable(&self, _batch_key: &str) -> bool {
        false
    }

    fn process(&self, input: &Path) -> Result<Vec<PathBuf>, StepError> {
        let parsed = parse_file(input)?;
        if !parsed.malformed.is_empty() {
            warn!(
                file = %input.display(),
                malformed = parsed.malformed.len(),
                "Raw file contains malformed packets"
            );
        }

        let kinds = Arc::clone(&self.kinds);
        let sequences = sequence_packets(parsed.packets, move |key| kinds.bypasses_sequencing(key));

        let mut outputs = Vec::new();
        self.store_groups(sequences.complete, false, &mut outputs)?;
        if !sequences.incomplete.is_empty() {
            info!(
                file = %input.display(),
                incomplete = sequences.incomplete.len(),
                "Keeping incomplete sequences"
            );
            self.store_groups(sequences.incomplete, true, &mut outputs)?;
        }

        outputs.sort();
        outputs.dedup();
        debug!(file = %input.display(), outputs = outputs.len(), "Ingested raw file");
        Ok(outputs)
    }
}

// ============================================================================
// Level-up
// ============================================================================

/// Calibration or reformatting from one level to the next, supplied from
/// outside the pipeline core.
pub trait ProductTransform: Send + Sync {
    fn source_level(&self) -> ProductLevel;

    fn target_level(&self) -> ProductLevel;

    /// Produce the next-level product. The result's identity decides which
    /// kind it is archived as.
    fn transform(&self, kind: ProductKind, product: &Product) -> Result<Product, String>;
}

pub struct LevelUpStep {
    input_archive: Arc<ProductArchive>,
    output_archive: Arc<ProductArchive>,
    kinds: Arc<KindRegistry>,
    transform: Arc<dyn ProductTransform>,
}

impl LevelUpStep {
    pub fn new(
        input_archive: Arc<ProductArchive>,
        output_archive: Arc<ProductArchive>,
        kinds: Arc<KindRegistry>,
        transform: Arc<dyn ProductTransform>,
    ) -> Self {
        Self {
            input_archive,
            output_archive,
            kinds,
            transform,
        }
    }

    fn parse_name(input: &Path) -> Option<ProductFileName> {
        input.file_name()?.to_str()?.parse().ok()
    }
}

impl ProcessingStep for LevelUpStep {
    fn step_name(&self) -> &str {
        "level-up"
    }

    fn identity(&self, input: &Path) -> Option<LedgerIdentity> {
        let name = Self::parse_name(input)?;
        if name.level != self.transform.source_level() {
            return None;
        }
        Some(LedgerIdentity::new(
            name.descriptor.clone(),
            self.transform.target_level(),
            name.product_type().unwrap_or_default(),
            self.output_archive.version(),
        ))
    }

    fn batch_key(&self, input: &Path) -> String {
        Self::parse_name(input)
            .map(|n| n.descriptor)
            .unwrap_or_default()
    }

    fn process(&self, input: &Path) -> Result<Vec<PathBuf>, StepError> {
        let name = Self::parse_name(input).ok_or_else(|| StepError::UnknownKind(input.display().to_string()))?;
        let product = self.input_archive.read(input)?;
        let source_kind = self
            .kinds
            .resolve_identity(&product.identity)
            .ok_or_else(|| StepError::UnknownKind(product.identity.to_string()))?;

        let output = self
            .transform
            .transform(source_kind, &product)
            .map_err(|message| StepError::Collaborator {
                collaborator: "product transform",
                input: input.to_path_buf(),
                message,
            })?;
        let target_kind = self
            .kinds
            .resolve_identity(&output.identity)
            .ok_or_else(|| StepError::UnknownKind(output.identity.to_string()))?;

        Ok(self.output_archive.store(target_kind, &output, name.incomplete)?)
    }
}

// ============================================================================
// Aspect
// ============================================================================

/// L1 maxi housekeeping to the `ANC` aspect product.
///
/// The first four counts of every housekeeping sample are the photodiode
/// signals handed to the solver; each solved sample becomes one data row
/// holding `[y, z]`. Samples of failed batches are left out. If no batch
/// succeeds the input fails and is retried on the next run.
pub struct AspectStep {
    input_archive: Arc<ProductArchive>,
    output_archive: Arc<ProductArchive>,
    solver: Arc<dyn AspectSolver>,
    batch_size: usize,
}

impl AspectStep {
    pub const SOURCE_DESCRIPTOR: &'static str = "stix-hk-maxi";

    pub fn new(
        input_archive: Arc<ProductArchive>,
        output_archive: Arc<ProductArchive>,
        solver: Arc<dyn AspectSolver>,
        batch_size: usize,
    ) -> Self {
        Self {
            input_archive,
            output_archive,
            solver,
            batch_size,
        }
    }

    /// Step with the solver batch size taken from `[aspect]`.
    pub fn from_config(
        input_archive: Arc<ProductArchive>,
        output_archive: Arc<ProductArchive>,
        solver: Arc<dyn AspectSolver>,
        config: &AspectConfig,
    ) -> Self {
        Self::new(input_archive, output_archive, solver, config.batch_size)
    }

    pub fn output_identity() -> ProductIdentity {
        ProductIdentity {
            level: ProductLevel::ANC,
            product_type: "anc".to_string(),
            name: "asp".to_string(),
            ssid: None,
        }
    }

    fn samples(product: &Product) -> Vec<AspectSample> {
        product
            .data()
            .iter()
            .map(|row| {
                let mut signals = [0.0; 4];
                for (slot, value) in signals.iter_mut().zip(&row.counts) {
                    *slot = *value;
                }
                AspectSample {
                    time: row.time,
                    signals,
                }
            })
            .collect()
    }
}

impl ProcessingStep for AspectStep {
    fn step_name(&self) -> &str {
        "aspect"
    }

    fn identity(&self, input: &Path) -> Option<LedgerIdentity> {
        let name = LevelUpStep::parse_name(input)?;
        if name.level != ProductLevel::L1 || name.descriptor != Self::SOURCE_DESCRIPTOR {
            return None;
        }
        let output = Self::output_identity();
        Some(LedgerIdentity::new(
            output.name,
            output.level,
            output.product_type,
            self.output_archive.version(),
        ))
    }

    fn batch_key(&self, _input: &Path) -> String {
        "asp".to_string()
    }

    fn process(&self, input: &Path) -> Result<Vec<PathBuf>, StepError> {
        let product = self.input_archive.read(input)?;
        let solution = solve_in_batches(self.solver.as_ref(), &Self::samples(&product), self.batch_size);
        if solution.solved() == 0 && !product.data().is_empty() {
            let message = solution
                .failed_batches
                .first()
                .map(|(_, err)| err.to_string())
                .unwrap_or_else(|| "no samples solved".to_string());
            return Err(StepError::Collaborator {
                collaborator: "aspect solver",
                input: input.to_path_buf(),
                message,
            });
        }
        if !solution.failed_batches.is_empty() {
            warn!(
                file = %input.display(),
                failed_batches = solution.failed_batches.len(),
                solved = solution.solved(),
                "Aspect solution is partial"
            );
        }

        let data: Vec<DataRow> = product
            .data()
            .iter()
            .zip(&solution.offsets)
            .filter_map(|(row, offset)| {
                offset.map(|o| DataRow {
                    control_index: row.control_index,
                    time: row.time,
                    timedel: row.timedel,
                    counts: vec![o.y, o.z],
                    packet: None,
                })
            })
            .collect();
        let output = Product::new(
            Self::output_identity(),
            product.control().to_vec(),
            data,
            product.idb_versions().clone(),
        )
        .map_err(|e| StepError::Collaborator {
            collaborator: "aspect solver",
            input: input.to_path_buf(),
            message: e.to_string(),
        })?;

        // Aspect files follow the daily layout of their housekeeping source.
        Ok(self.output_archive.store(ProductKind::HkMaxi, &output, false)?)
    }
}
