//! Publish History Storage
//!
//! Every file offered for publication, keyed by its exact file name, plus a
//! secondary index grouping rows by ESA name in first-seen order.
//!
//! Trees:
//! - `published`: `name -> PublishRecord (JSON)`
//! - `published_by_esa`: `esa_name \0 seq(u64 BE) -> name`
//!
//! A row and its index entry are written in one transaction. Rows are never
//! updated or deleted.

use super::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PUBLISHED_TREE: &str = "published";
const ESA_INDEX_TREE: &str = "published_by_esa";

/// Terminal outcome of a publish decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishResult {
    Published,
    Ignored,
    Modified,
    Blacklisted,
    Error,
}

impl fmt::Display for PublishResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Published => "PUBLISHED",
            Self::Ignored => "IGNORED",
            Self::Modified => "MODIFIED",
            Self::Blacklisted => "BLACKLISTED",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// One row of the publish history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRecord {
    /// Exact candidate file name (unique)
    pub name: String,
    /// Where the delivered copy lives, or the parked copy for errors
    pub path: PathBuf,
    pub version: u32,
    pub published_at: DateTime<Utc>,
    /// Modification time of the candidate when it was decided
    pub modified_at: DateTime<Utc>,
    pub esa_name: String,
    /// Name the file was delivered under when it became a supplement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_esa_name: Option<String>,
    pub result: PublishResult,
    /// md5 of the payload section, hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_digest: Option<String>,
    /// First-seen order, assigned on insert
    #[serde(default)]
    pub seq: u64,
}

/// Publish history over two sled trees.
#[derive(Clone)]
pub struct PublishHistoryStorage {
    db: Arc<sled::Db>,
    published: sled::Tree,
    by_esa: sled::Tree,
}

impl PublishHistoryStorage {
    /// Open or create a standalone publish history at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(Arc::new(sled::open(path)?))
    }

    pub fn from_db(db: Arc<sled::Db>) -> Result<Self, StorageError> {
        let published = db.open_tree(PUBLISHED_TREE)?;
        let by_esa = db.open_tree(ESA_INDEX_TREE)?;
        Ok(Self { db, published, by_esa })
    }

    pub fn contains(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.published.contains_key(name.as_bytes())?)
    }

    pub fn get(&self, name: &str) -> Result<Option<PublishRecord>, StorageError> {
        match self.published.get(name.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Insert a new row. The first-seen sequence number is assigned here.
    /// Returns `false` without writing if a row with this name exists.
    pub fn add(&self, record: &PublishRecord) -> Result<bool, StorageError> {
        let mut record = record.clone();
        record.seq = self.db.generate_id()?;
        let value = serde_json::to_vec(&record)?;
        let mut index_key = esa_prefix(&record.esa_name);
        index_key.extend_from_slice(&record.seq.to_be_bytes());
        let name = record.name.as_bytes();

        let result: Result<bool, TransactionError<()>> =
            (&self.published, &self.by_esa).transaction(|(published, by_esa)| -> ConflictableTransactionResult<bool, ()> {
                if published.get(name)?.is_some() {
                    return Ok(false);
                }
                published.insert(name, value.as_slice())?;
                by_esa.insert(index_key.as_slice(), name)?;
                Ok(true)
            });

        match result {
            Ok(inserted) => Ok(inserted),
            Err(TransactionError::Storage(e)) => Err(e.into()),
            Err(TransactionError::Abort(())) => Err(StorageError::DatabaseError(format!(
                "insert of {} aborted",
                record.name
            ))),
        }
    }

    /// All rows sharing `esa_name`, in first-seen order.
    pub fn group(&self, esa_name: &str) -> Result<Vec<PublishRecord>, StorageError> {
        let mut rows = Vec::new();
        for item in self.by_esa.scan_prefix(esa_prefix(esa_name)) {
            let (key, name) = item?;
            let row = self.published.get(&name)?.ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "index entry {} points at missing row",
                    String::from_utf8_lossy(&key)
                ))
            })?;
            rows.push(serde_json::from_slice(&row)?);
        }
        Ok(rows)
    }

    /// Every row, ordered by name.
    pub fn records(&self) -> Result<Vec<PublishRecord>, StorageError> {
        let mut rows = Vec::with_capacity(self.published.len());
        for item in self.published.iter() {
            let (_key, value) = item?;
            rows.push(serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }

    /// Get total number of rows
    pub fn count(&self) -> usize {
        self.published.len()
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn esa_prefix(esa_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(esa_name.len() + 9);
    key.extend_from_slice(esa_name.as_bytes());
    key.push(0);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(name: &str, esa: &str, result: PublishResult) -> PublishRecord {
        PublishRecord {
            name: name.to_string(),
            path: PathBuf::from("/target").join(name),
            version: 1,
            published_at: Utc::now(),
            modified_at: Utc::now(),
            esa_name: esa.to_string(),
            modified_esa_name: None,
            result,
            payload_digest: None,
            seq: 0,
        }
    }

    #[test]
    fn test_unique_name() {
        let dir = tempdir().unwrap();
        let storage = PublishHistoryStorage::open(dir.path()).unwrap();
        assert!(storage.add(&row("a.fits", "a", PublishResult::Published)).unwrap());
        assert!(!storage.add(&row("a.fits", "a", PublishResult::Ignored)).unwrap());
        assert_eq!(storage.count(), 1);
        assert_eq!(storage.get("a.fits").unwrap().unwrap().result, PublishResult::Published);
    }

    #[test]
    fn test_group_in_first_seen_order() {
        let dir = tempdir().unwrap();
        let storage = PublishHistoryStorage::open(dir.path()).unwrap();
        storage.add(&row("z.fits", "grp", PublishResult::Published)).unwrap();
        storage.add(&row("a.fits", "grp", PublishResult::Modified)).unwrap();
        storage.add(&row("m.fits", "grp-other", PublishResult::Published)).unwrap();

        let names: Vec<String> = storage.group("grp").unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["z.fits", "a.fits"]);
        assert_eq!(storage.group("grp-other").unwrap().len(), 1);
        assert!(storage.group("gr").unwrap().is_empty());
    }

    #[test]
    fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = PublishHistoryStorage::open(dir.path()).unwrap();
            storage.add(&row("a.fits", "a", PublishResult::Published)).unwrap();
            storage.flush().unwrap();
        }
        let storage = PublishHistoryStorage::open(dir.path()).unwrap();
        assert!(storage.contains("a.fits").unwrap());
        assert_eq!(storage.records().unwrap().len(), 1);
    }
}
