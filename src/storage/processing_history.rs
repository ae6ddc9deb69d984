//! Processing History Ledger
//!
//! Append-only record of which input artifact each stage has turned into
//! which output, and when. A stage consults it before doing work; an input
//! counts as processed only if a record exists whose timestamp is newer than
//! the input's modification time, so regenerating an input invalidates the
//! old record.
//!
//! Key layout (tree `processed_products`):
//! `name \0 level \0 type \0 version(u32 BE) \0 input \0 processed_at(i64 BE µs) \0 output`
//!
//! The prefix up to and including `input \0` identifies an
//! (output identity, input) pair; each successful completion adds one key
//! below it. Writes are insert-only.

use super::StorageError;
use crate::types::ProductLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const TREE_NAME: &str = "processed_products";
const SEP: u8 = 0;

/// Output identity a stage records work under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerIdentity {
    pub name: String,
    pub level: ProductLevel,
    pub product_type: String,
    pub version: u32,
}

impl LedgerIdentity {
    pub fn new(name: impl Into<String>, level: ProductLevel, product_type: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            level,
            product_type: product_type.into(),
            version,
        }
    }
}

impl fmt::Display for LedgerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{} V{:02}", self.level, self.product_type, self.name, self.version)
    }
}

/// One completed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub identity: LedgerIdentity,
    pub input_path: PathBuf,
    /// `None` when the input produced no output
    pub output_path: Option<PathBuf>,
    pub processed_at: DateTime<Utc>,
}

/// Processing history over a sled tree.
#[derive(Clone)]
pub struct ProcessingHistoryLedger {
    db: Arc<sled::Db>,
    tree: sled::Tree,
}

impl ProcessingHistoryLedger {
    /// Open or create a standalone ledger at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(Arc::new(sled::open(path)?))
    }

    /// Ledger over an already open database
    pub fn from_db(db: Arc<sled::Db>) -> Result<Self, StorageError> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree })
    }

    /// Whether `input` has been processed into `identity` after `input_mtime`.
    pub fn has_processed(
        &self,
        identity: &LedgerIdentity,
        input: &Path,
        input_mtime: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        for item in self.tree.scan_prefix(prefix(identity, input)) {
            let (_key, value) = item?;
            let record: ProcessedRecord = serde_json::from_slice(&value)?;
            if record.processed_at > input_mtime {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Record one completion. Returns `false` if this exact record already
    /// exists; nothing is ever overwritten.
    pub fn add_processed(&self, record: &ProcessedRecord) -> Result<bool, StorageError> {
        let mut key = prefix(&record.identity, &record.input_path);
        key.extend_from_slice(&record.processed_at.timestamp_micros().to_be_bytes());
        key.push(SEP);
        if let Some(output) = &record.output_path {
            key.extend_from_slice(path_bytes(output).as_bytes());
        }
        let value = serde_json::to_vec(record)?;

        let inserted = self
            .tree
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?
            .is_ok();
        debug!(
            identity = %record.identity,
            input = %record.input_path.display(),
            inserted,
            "Processing ledger insert"
        );
        Ok(inserted)
    }

    /// All records for an (identity, input) pair, oldest first.
    pub fn records_for(&self, identity: &LedgerIdentity, input: &Path) -> Result<Vec<ProcessedRecord>, StorageError> {
        let mut records = Vec::new();
        for item in self.tree.scan_prefix(prefix(identity, input)) {
            let (_key, value) = item?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    /// Get total number of records
    pub fn count(&self) -> usize {
        self.tree.len()
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn path_bytes(path: &Path) -> std::borrow::Cow<'_, str> {
    path.to_string_lossy()
}

fn prefix(identity: &LedgerIdentity, input: &Path) -> Vec<u8> {
    let mut key = Vec::with_capacity(128);
    for part in [identity.name.as_str(), identity.level.as_str(), identity.product_type.as_str()] {
        key.extend_from_slice(part.as_bytes());
        key.push(SEP);
    }
    key.extend_from_slice(&identity.version.to_be_bytes());
    key.push(SEP);
    key.extend_from_slice(path_bytes(input).as_bytes());
    key.push(SEP);
    key
}
