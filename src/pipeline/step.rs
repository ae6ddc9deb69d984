//! Processing step contract
//!
//! A step turns one input file into zero or more output files. The
//! orchestrator asks the step under which ledger identity the work is
//! recorded and how inputs batch together, then runs `process` on worker
//! threads. Steps never write the ledger themselves.

use crate::acquisition::PacketError;
use crate::products::{ArchiveError, DecodeError};
use crate::storage::LedgerIdentity;
use crate::types::NamingError;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error("no product kind for {0}")]
    UnknownKind(String),

    #[error("{collaborator} failed on {input}: {message}")]
    Collaborator {
        collaborator: &'static str,
        input: PathBuf,
        message: String,
    },
}

pub trait ProcessingStep: Send + Sync {
    fn step_name(&self) -> &str;

    /// Identity this input's work is recorded under, or `None` if the step
    /// does not handle the input.
    fn identity(&self, input: &Path) -> Option<LedgerIdentity>;

    /// Inputs with the same key are batched together.
    fn batch_key(&self, input: &Path) -> String;

    /// Whether a batch may be cut into sub-batches that run in parallel.
    /// Only true when inputs of one batch never write the same output file.
    fn splittable(&self, _batch_key: &str) -> bool {
        true
    }

    /// Do the work; returns the files written.
    fn process(&self, input: &Path) -> Result<Vec<PathBuf>, StepError>;
}
