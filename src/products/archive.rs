//! Product archive
//!
//! Deterministic on-disk layout `{root}/{level}/{descriptor}/{file_name}`.
//! Storing a product splits it into files, and any file that already exists
//! is merged with the new rows before being rewritten, so storing the same
//! product twice leaves the archive unchanged.

use super::format::{EnvelopeFormat, FormatError, ProductFormat};
use super::kinds::{FileGrouping, ProductKind};
use super::merge::{MergeError, ProductMerger};
use crate::types::{Product, ProductError, ProductFileName};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("merging into {path}: {source}")]
    Merge {
        path: PathBuf,
        #[source]
        source: MergeError,
    },

    #[error(transparent)]
    Product(#[from] ProductError),
}

pub struct ProductArchive {
    root: PathBuf,
    format: Arc<dyn ProductFormat>,
    version: u32,
}

impl ProductArchive {
    pub fn new<P: AsRef<Path>>(root: P, format: Arc<dyn ProductFormat>, version: u32) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            format,
            version,
        }
    }

    /// Archive using the envelope container.
    pub fn envelope<P: AsRef<Path>>(root: P, version: u32) -> Self {
        Self::new(root, Arc::new(EnvelopeFormat), version)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn format(&self) -> &dyn ProductFormat {
        self.format.as_ref()
    }

    pub fn path_for(&self, name: &ProductFileName) -> PathBuf {
        self.root
            .join(name.level.as_str())
            .join(&name.descriptor)
            .join(name.file_name())
    }

    /// Split `product` into archive files, merging with existing ones.
    /// Returns the written paths in split order.
    ///
    /// Per-request files are named after the extent of their request, so a
    /// part that widens the extent replaces the older file of the same
    /// request rather than landing next to it.
    pub fn store(&self, kind: ProductKind, product: &Product, incomplete: bool) -> Result<Vec<PathBuf>, ArchiveError> {
        let grouping = kind.file_grouping();
        let mut written = Vec::new();
        for (name, part) in self.split(grouping, product, incomplete)? {
            let previous: Vec<PathBuf> = match grouping {
                FileGrouping::Daily => Some(self.path_for(&name)).filter(|p| p.exists()).into_iter().collect(),
                FileGrouping::PerRequest => self.request_files(&name)?,
            };

            let mut merged = part;
            for path in &previous {
                let existing = self.format.read(path)?;
                merged = ProductMerger::for_kind(kind)
                    .merge(&existing, &merged)
                    .map_err(|source| ArchiveError::Merge {
                        path: path.clone(),
                        source,
                    })?;
            }

            let name = match grouping {
                FileGrouping::Daily => name,
                FileGrouping::PerRequest => ProductFileName {
                    date_range: request_date_range(&merged),
                    ..name
                },
            };
            let path = self.path_for(&name);
            let header = EnvelopeFormat::header(&name.file_name(), self.version, incomplete);
            self.format.write(&merged, &header, &path)?;

            for stale in previous.iter().filter(|p| **p != path) {
                std::fs::remove_file(stale).map_err(|e| FormatError::Io(stale.clone(), e))?;
                debug!(old = %stale.display(), new = %path.display(), "Replaced request file");
            }
            debug!(path = %path.display(), rows = merged.data().len(), "Stored product file");
            written.push(path);
        }
        info!(
            product = %product.identity,
            files = written.len(),
            incomplete,
            "Archived product"
        );
        Ok(written)
    }

    /// Existing files of the request `name` belongs to, whatever their extent.
    fn request_files(&self, name: &ProductFileName) -> Result<Vec<PathBuf>, ArchiveError> {
        let dir = self.root.join(name.level.as_str()).join(&name.descriptor);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FormatError::Io(dir, e).into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FormatError::Io(dir.clone(), e))?;
            let Some(existing) = entry
                .file_name()
                .to_str()
                .and_then(|f| f.parse::<ProductFileName>().ok())
            else {
                continue;
            };
            let same_request = existing.level == name.level
                && existing.descriptor == name.descriptor
                && existing.version == name.version
                && existing.incomplete == name.incomplete
                && existing.free_field == name.free_field
                && existing.date_range.contains('-');
            if same_request {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    pub fn read(&self, path: &Path) -> Result<Product, ArchiveError> {
        Ok(self.format.read(path)?)
    }

    fn split(
        &self,
        grouping: FileGrouping,
        product: &Product,
        incomplete: bool,
    ) -> Result<Vec<(ProductFileName, Product)>, ProductError> {
        let descriptor = product.identity.descriptor();
        let level = product.identity.level;
        let named = |date_range: String| {
            ProductFileName::new(level, descriptor.clone(), date_range, self.version).with_incomplete(incomplete)
        };

        let parts = match grouping {
            FileGrouping::Daily => product
                .split_by_day()?
                .into_iter()
                .map(|(day, part)| (named(format!("{:010}", u64::from(day) * 86_400)), part))
                .collect(),
            FileGrouping::PerRequest => product
                .split_by_request()?
                .into_iter()
                .map(|(request, part)| {
                    let name = named(request_date_range(&part));
                    let name = match request {
                        Some(id) => name.with_free_field(id.to_string()),
                        None => name,
                    };
                    (name, part)
                })
                .collect(),
        };
        Ok(parts)
    }
}

/// `{start}-{end}` in SCET seconds, the date field of per-request files.
fn request_date_range(product: &Product) -> String {
    let range = product.scet_range();
    format!("{:010}-{:010}", range.start().coarse(), range.end().coarse())
}
