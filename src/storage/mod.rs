//! Ledger Storage
//!
//! Both ledgers live in one sled database: the processing history (which
//! inputs each stage has already turned into outputs) and the publish history
//! (every file ever offered to the downstream archive and what was decided
//! about it). Each ledger owns its own trees.

pub mod lockfile;
pub mod processing_history;
pub mod publish_history;

pub use lockfile::ProcessLock;
pub use processing_history::{LedgerIdentity, ProcessedRecord, ProcessingHistoryLedger};
pub use publish_history::{PublishHistoryStorage, PublishRecord, PublishResult};

use std::path::Path;
use std::sync::Arc;

/// Error type for ledger operations
#[derive(Debug)]
pub enum StorageError {
    DatabaseError(String),
    SerializationError(String),
    /// A stored key or value does not decode
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            StorageError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            StorageError::Corrupt(msg) => write!(f, "Corrupt ledger entry: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

/// Both ledgers over one database handle.
#[derive(Clone)]
pub struct Ledgers {
    pub processing: ProcessingHistoryLedger,
    pub publish: PublishHistoryStorage,
}

impl Ledgers {
    /// Open or create the ledger database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = Arc::new(sled::open(path)?);
        Ok(Self {
            processing: ProcessingHistoryLedger::from_db(Arc::clone(&db))?,
            publish: PublishHistoryStorage::from_db(db)?,
        })
    }

    /// Flush pending writes of both ledgers to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.processing.flush()?;
        self.publish.flush()
    }
}
