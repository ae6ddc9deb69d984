//! Product container format
//!
//! Products are written as an envelope of three newline-separated JSON
//! sections:
//!
//! 1. header: file name, creation time, version, status, producer
//! 2. control: identity, decode-table versions, control rows
//! 3. data: data rows
//!
//! The data section is the payload section: two files whose data sections
//! are byte-identical carry the same science content, whatever their
//! headers say. Writes go through a temporary file and a rename so a crash
//! never leaves a half-written product at its final path.

use crate::types::{ControlRow, DataRow, Product, ProductError, ProductIdentity, SCETimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const PRODUCER: &str = concat!("stix-pipeline ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("{path}: {section} section: {source}")]
    Json {
        path: PathBuf,
        section: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}: missing {1} section")]
    MissingSection(PathBuf, &'static str),

    #[error("{0}: {1}")]
    Product(PathBuf, #[source] ProductError),
}

/// Header-only fields, excluded from content comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub version: u32,
    /// Empty for complete products, `U` for interim ones
    pub status: String,
    pub producer: String,
}

#[derive(Serialize, Deserialize)]
struct ControlSection {
    identity: ProductIdentity,
    idb_versions: BTreeMap<String, SCETimeRange>,
    control: Vec<ControlRow>,
}

#[derive(Serialize, Deserialize)]
struct DataSection {
    data: Vec<DataRow>,
}

/// Writer, reader and payload extraction for one container format.
pub trait ProductFormat: Send + Sync {
    fn write(&self, product: &Product, header: &EnvelopeHeader, path: &Path) -> Result<(), FormatError>;

    fn read(&self, path: &Path) -> Result<Product, FormatError>;

    fn read_header(&self, path: &Path) -> Result<EnvelopeHeader, FormatError>;

    /// Bytes of the section used for content comparison.
    fn read_payload(&self, path: &Path) -> Result<Vec<u8>, FormatError>;
}

/// JSON-lines envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeFormat;

impl EnvelopeFormat {
    pub fn header(file_name: &str, version: u32, incomplete: bool) -> EnvelopeHeader {
        EnvelopeHeader {
            file_name: file_name.to_string(),
            created_at: Utc::now(),
            version,
            status: if incomplete { "U".to_string() } else { String::new() },
            producer: PRODUCER.to_string(),
        }
    }

    fn sections(path: &Path) -> Result<Vec<String>, FormatError> {
        let text = fs::read_to_string(path).map_err(|e| FormatError::Io(path.to_path_buf(), e))?;
        Ok(text.lines().map(str::to_string).collect())
    }

    fn section<'a>(lines: &'a [String], idx: usize, name: &'static str, path: &Path) -> Result<&'a str, FormatError> {
        lines
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| FormatError::MissingSection(path.to_path_buf(), name))
    }
}

fn to_line<T: Serialize>(value: &T, path: &Path, section: &'static str) -> Result<String, FormatError> {
    serde_json::to_string(value).map_err(|source| FormatError::Json {
        path: path.to_path_buf(),
        section,
        source,
    })
}

fn from_line<T: for<'de> Deserialize<'de>>(line: &str, path: &Path, section: &'static str) -> Result<T, FormatError> {
    serde_json::from_str(line).map_err(|source| FormatError::Json {
        path: path.to_path_buf(),
        section,
        source,
    })
}

impl ProductFormat for EnvelopeFormat {
    fn write(&self, product: &Product, header: &EnvelopeHeader, path: &Path) -> Result<(), FormatError> {
        let io_err = |e| FormatError::Io(path.to_path_buf(), e);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let control = ControlSection {
            identity: product.identity.clone(),
            idb_versions: product.idb_versions().clone(),
            control: product.control().to_vec(),
        };
        let data = DataSection {
            data: product.data().to_vec(),
        };
        let body = format!(
            "{}\n{}\n{}\n",
            to_line(header, path, "header")?,
            to_line(&control, path, "control")?,
            to_line(&data, path, "data")?
        );

        let tmp = path.with_extension("fits.part");
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(body.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Product, FormatError> {
        let lines = Self::sections(path)?;
        let control: ControlSection = from_line(Self::section(&lines, 1, "control", path)?, path, "control")?;
        let data: DataSection = from_line(Self::section(&lines, 2, "data", path)?, path, "data")?;
        Product::new(control.identity, control.control, data.data, control.idb_versions)
            .map_err(|e| FormatError::Product(path.to_path_buf(), e))
    }

    fn read_header(&self, path: &Path) -> Result<EnvelopeHeader, FormatError> {
        let lines = Self::sections(path)?;
        from_line(Self::section(&lines, 0, "header", path)?, path, "header")
    }

    fn read_payload(&self, path: &Path) -> Result<Vec<u8>, FormatError> {
        let lines = Self::sections(path)?;
        Ok(Self::section(&lines, 2, "data", path)?.as_bytes().to_vec())
    }
}
