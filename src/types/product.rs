//! Decoded data product
//!
//! A product is a `control` table (one row per acquisition or request) and a
//! `data` table (one row per sample). Every data row points at a control row
//! through `control_index`; [`Product::new`] refuses to build a product where
//! that does not hold.

use super::time::{SCETime, SCETimeRange, TimeError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProductError {
    #[error("product has no control rows")]
    Empty,

    #[error("data row {row} references missing control index {control_index}")]
    DanglingControlIndex { row: usize, control_index: u32 },

    #[error("unknown product level '{0}'")]
    UnknownLevel(String),

    #[error(transparent)]
    Time(#[from] TimeError),
}

// ============================================================================
// Identity
// ============================================================================

/// Processing stage label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProductLevel {
    /// Raw level binary: packets grouped per kind
    LB,
    L0,
    L1,
    L2,
    /// Ancillary products (aspect and similar)
    ANC,
}

impl ProductLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LB => "LB",
            Self::L0 => "L0",
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::ANC => "ANC",
        }
    }

    /// The level a product is promoted to by the next processing step.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::LB => Some(Self::L0),
            Self::L0 => Some(Self::L1),
            Self::L1 => Some(Self::L2),
            Self::L2 | Self::ANC => None,
        }
    }
}

impl fmt::Display for ProductLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductLevel {
    type Err = ProductError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LB" => Ok(Self::LB),
            "L0" => Ok(Self::L0),
            "L1" => Ok(Self::L1),
            "L2" => Ok(Self::L2),
            "ANC" => Ok(Self::ANC),
            other => Err(ProductError::UnknownLevel(other.to_string())),
        }
    }
}

/// `(level, type, name, ssid)` identity of a product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductIdentity {
    pub level: ProductLevel,
    /// `hk`, `ql`, `sci`, `aux`; for level binary the service type
    pub product_type: String,
    /// Kind name; for level binary `{subtype}[-{ssid}]`
    pub name: String,
    pub ssid: Option<u8>,
}

impl ProductIdentity {
    /// File-name descriptor, `stix-{type}-{name}`.
    pub fn descriptor(&self) -> String {
        format!("stix-{}-{}", self.product_type, self.name)
    }
}

impl fmt::Display for ProductIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level, self.descriptor())
    }
}

// ============================================================================
// Rows
// ============================================================================

/// One acquisition or request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRow {
    pub index: u32,
    pub scet_coarse: u32,
    pub scet_fine: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_count: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u32>,
    /// Declared packet data length (level binary only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_length: Option<u16>,
    /// Integration time in seconds
    #[serde(default)]
    pub integration_time: f64,
    /// Raw telemetry file this row was decoded from
    #[serde(default)]
    pub raw_file: String,
}

impl ControlRow {
    pub fn scet(&self) -> SCETime {
        SCETime::from_parts(self.scet_coarse, self.scet_fine)
    }
}

/// One sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub control_index: u32,
    /// Sample time in SCET seconds
    pub time: f64,
    /// Sample duration in seconds
    #[serde(default)]
    pub timedel: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counts: Vec<f64>,
    /// Raw packet bytes (level binary only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet: Option<Vec<u8>>,
}

// ============================================================================
// Product
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub identity: ProductIdentity,
    control: Vec<ControlRow>,
    data: Vec<DataRow>,
    /// Decode-table version name to the time range it was used for
    idb_versions: BTreeMap<String, SCETimeRange>,
    scet_range: SCETimeRange,
}

impl Product {
    /// Build a product, checking references and normalizing row order.
    ///
    /// Control rows are sorted by `(scet, sequence_count, request_id)` and
    /// renumbered from 0; data rows are remapped and sorted by time.
    pub fn new(
        identity: ProductIdentity,
        control: Vec<ControlRow>,
        data: Vec<DataRow>,
        idb_versions: BTreeMap<String, SCETimeRange>,
    ) -> Result<Self, ProductError> {
        let known: HashMap<u32, usize> = control
            .iter()
            .enumerate()
            .map(|(pos, row)| (row.index, pos))
            .collect();
        for (row, sample) in data.iter().enumerate() {
            if !known.contains_key(&sample.control_index) {
                return Err(ProductError::DanglingControlIndex {
                    row,
                    control_index: sample.control_index,
                });
            }
        }

        let mut control = control;
        let mut data = data;
        control.sort_by(|a, b| {
            (a.scet(), a.sequence_count, a.request_id, a.index)
                .cmp(&(b.scet(), b.sequence_count, b.request_id, b.index))
        });
        let renumber: HashMap<u32, u32> = control
            .iter()
            .enumerate()
            .map(|(new, row)| (row.index, new as u32))
            .collect();
        for (new, row) in control.iter_mut().enumerate() {
            row.index = new as u32;
        }
        for sample in &mut data {
            if let Some(&new) = renumber.get(&sample.control_index) {
                sample.control_index = new;
            }
        }
        data.sort_by(|a, b| {
            a.time
                .total_cmp(&b.time)
                .then(a.control_index.cmp(&b.control_index))
        });

        let scet_range = compute_range(&control, &data)?;
        Ok(Self {
            identity,
            control,
            data,
            idb_versions,
            scet_range,
        })
    }

    pub fn control(&self) -> &[ControlRow] {
        &self.control
    }

    pub fn data(&self) -> &[DataRow] {
        &self.data
    }

    pub fn idb_versions(&self) -> &BTreeMap<String, SCETimeRange> {
        &self.idb_versions
    }

    /// Overall min/max time over control and data rows.
    pub fn scet_range(&self) -> SCETimeRange {
        self.scet_range
    }

    /// Product restricted to the control rows accepted by `keep` and their
    /// samples. `None` when nothing is kept.
    pub fn subset<F>(&self, keep: F) -> Result<Option<Product>, ProductError>
    where
        F: Fn(&ControlRow) -> bool,
    {
        let control: Vec<ControlRow> = self.control.iter().filter(|r| keep(r)).cloned().collect();
        if control.is_empty() {
            return Ok(None);
        }
        let kept: std::collections::HashSet<u32> = control.iter().map(|r| r.index).collect();
        let data = self
            .data
            .iter()
            .filter(|d| kept.contains(&d.control_index))
            .cloned()
            .collect();
        Product::new(self.identity.clone(), control, data, self.idb_versions.clone()).map(Some)
    }

    /// Split into one product per onboard day of the control rows.
    pub fn split_by_day(&self) -> Result<Vec<(u32, Product)>, ProductError> {
        let days: std::collections::BTreeSet<u32> =
            self.control.iter().map(|r| r.scet().day()).collect();
        let mut parts = Vec::with_capacity(days.len());
        for day in days {
            if let Some(part) = self.subset(|r| r.scet().day() == day)? {
                parts.push((day, part));
            }
        }
        Ok(parts)
    }

    /// Split into one product per request id. Rows without a request id are
    /// grouped under `None`.
    pub fn split_by_request(&self) -> Result<Vec<(Option<u32>, Product)>, ProductError> {
        let requests: std::collections::BTreeSet<Option<u32>> =
            self.control.iter().map(|r| r.request_id).collect();
        let mut parts = Vec::with_capacity(requests.len());
        for request in requests {
            if let Some(part) = self.subset(|r| r.request_id == request)? {
                parts.push((request, part));
            }
        }
        Ok(parts)
    }
}

fn compute_range(control: &[ControlRow], data: &[DataRow]) -> Result<SCETimeRange, ProductError> {
    let first = control.first().ok_or(ProductError::Empty)?;
    let mut range = SCETimeRange::instant(first.scet());
    for row in control {
        range.expand(row.scet());
    }
    for sample in data {
        range.expand(SCETime::from_secs_f64(sample.time)?);
    }
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ProductIdentity {
        ProductIdentity {
            level: ProductLevel::L1,
            product_type: "ql".to_string(),
            name: "lightcurve".to_string(),
            ssid: Some(30),
        }
    }

    fn control(index: u32, coarse: u32) -> ControlRow {
        ControlRow {
            index,
            scet_coarse: coarse,
            scet_fine: 0,
            sequence_count: None,
            request_id: None,
            data_length: None,
            integration_time: 4.0,
            raw_file: "raw.bin".to_string(),
        }
    }

    fn sample(control_index: u32, time: f64) -> DataRow {
        DataRow {
            control_index,
            time,
            timedel: 4.0,
            counts: vec![1.0, 2.0],
            packet: None,
        }
    }

    #[test]
    fn test_dangling_control_index_rejected() {
        let err = Product::new(identity(), vec![control(0, 10)], vec![sample(3, 10.0)], BTreeMap::new());
        assert!(matches!(
            err,
            Err(ProductError::DanglingControlIndex { row: 0, control_index: 3 })
        ));
    }

    #[test]
    fn test_empty_rejected() {
        assert!(matches!(
            Product::new(identity(), vec![], vec![], BTreeMap::new()),
            Err(ProductError::Empty)
        ));
    }

    #[test]
    fn test_normalization_renumbers_and_remaps() {
        let product = Product::new(
            identity(),
            vec![control(7, 200), control(3, 100)],
            vec![sample(7, 200.0), sample(3, 100.0)],
            BTreeMap::new(),
        )
        .unwrap();
        let indices: Vec<u32> = product.control().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(product.control()[0].scet_coarse, 100);
        assert_eq!(product.data()[0].control_index, 0);
        assert_eq!(product.data()[1].control_index, 1);
        assert_eq!(product.scet_range().start(), SCETime::from_parts(100, 0));
        assert_eq!(product.scet_range().end(), SCETime::from_parts(200, 0));
    }

    #[test]
    fn test_split_by_day() {
        let product = Product::new(
            identity(),
            vec![control(0, 10), control(1, 86_400 + 5), control(2, 20)],
            vec![sample(0, 10.0), sample(1, 86_405.0), sample(2, 20.0)],
            BTreeMap::new(),
        )
        .unwrap();
        let parts = product.split_by_day().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, 0);
        assert_eq!(parts[0].1.control().len(), 2);
        assert_eq!(parts[0].1.data().len(), 2);
        assert_eq!(parts[1].0, 1);
        assert_eq!(parts[1].1.data()[0].control_index, 0);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("l1".parse::<ProductLevel>().unwrap(), ProductLevel::L1);
        assert!("L9".parse::<ProductLevel>().is_err());
        assert_eq!(ProductLevel::LB.next(), Some(ProductLevel::L0));
    }
}
