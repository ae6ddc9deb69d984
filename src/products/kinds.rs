//! Product kinds
//!
//! The closed set of product kinds the pipeline knows about, and the
//! dispatch table that maps a packet key and level to a kind. The table is
//! built once at startup and passed to whoever needs it.

use crate::types::{PacketKey, ProductIdentity, ProductLevel};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProductKind {
    /// Raw packets of any key, grouped per key
    LevelBinary,
    HkMini,
    HkMaxi,
    QlLightCurve,
    QlBackground,
    QlSpectra,
    QlVariance,
    QlFlareFlag,
    QlEnergy,
    QlTmStatusFlareList,
    SciXrayRpd,
    SciXrayCpd,
    SciXrayScpd,
    SciXrayVis,
    SciXraySpec,
    SciAspectBurst,
}

/// How control rows are identified when two products are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKeyPolicy {
    /// `(scet_coarse, scet_fine, sequence_count)`
    TimeAndSequence,
    /// `(scet_coarse, scet_fine, request_id)`
    TimeAndRequest,
    /// `(scet_coarse, scet_fine)`
    TimeOnly,
}

/// How a product is split into archive files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileGrouping {
    Daily,
    PerRequest,
}

struct KindSpec {
    kind: ProductKind,
    product_type: &'static str,
    name: &'static str,
    key: PacketKey,
    bypass: bool,
}

const fn spec(
    kind: ProductKind,
    product_type: &'static str,
    name: &'static str,
    service_type: u8,
    ssid: u8,
    bypass: bool,
) -> KindSpec {
    let subtype = if service_type == 3 { 25 } else { 6 };
    KindSpec {
        kind,
        product_type,
        name,
        key: PacketKey::new(service_type, subtype, Some(ssid)),
        bypass,
    }
}

const KIND_TABLE: &[KindSpec] = &[
    spec(ProductKind::HkMini, "hk", "mini", 3, 1, true),
    spec(ProductKind::HkMaxi, "hk", "maxi", 3, 2, true),
    spec(ProductKind::QlLightCurve, "ql", "lightcurve", 21, 30, true),
    spec(ProductKind::QlBackground, "ql", "background", 21, 31, true),
    spec(ProductKind::QlSpectra, "ql", "spectra", 21, 32, true),
    spec(ProductKind::QlVariance, "ql", "variance", 21, 33, true),
    spec(ProductKind::QlFlareFlag, "ql", "flareflag", 21, 34, true),
    spec(ProductKind::QlEnergy, "ql", "energy", 21, 41, false),
    spec(ProductKind::QlTmStatusFlareList, "ql", "tmstatusflarelist", 21, 43, true),
    spec(ProductKind::SciXrayRpd, "sci", "xray-rpd", 21, 20, false),
    spec(ProductKind::SciXrayCpd, "sci", "xray-cpd", 21, 21, false),
    spec(ProductKind::SciXrayScpd, "sci", "xray-scpd", 21, 22, false),
    spec(ProductKind::SciXrayVis, "sci", "xray-vis", 21, 23, false),
    spec(ProductKind::SciXraySpec, "sci", "xray-spec", 21, 24, false),
    spec(ProductKind::SciAspectBurst, "sci", "aspect-burst", 21, 42, false),
];

impl ProductKind {
    fn spec(self) -> Option<&'static KindSpec> {
        KIND_TABLE.iter().find(|s| s.kind == self)
    }

    /// Whether this kind handles packets of `key` at `level`.
    pub fn matches(self, service_type: u8, service_subtype: u8, ssid: Option<u8>, level: ProductLevel) -> bool {
        match self.spec() {
            None => level == ProductLevel::LB,
            Some(spec) => {
                level != ProductLevel::LB
                    && level != ProductLevel::ANC
                    && spec.key == PacketKey::new(service_type, service_subtype, ssid)
            }
        }
    }

    /// Kinds whose packets are never reassembled into multi-packet sequences.
    pub fn bypasses_sequencing(self) -> bool {
        self.spec().map(|s| s.bypass).unwrap_or(false)
    }

    pub fn control_key_policy(self) -> ControlKeyPolicy {
        match self.spec() {
            None => ControlKeyPolicy::TimeAndSequence,
            Some(spec) if spec.product_type == "sci" => ControlKeyPolicy::TimeAndRequest,
            Some(_) => ControlKeyPolicy::TimeOnly,
        }
    }

    pub fn file_grouping(self) -> FileGrouping {
        match self.spec() {
            Some(spec) if spec.product_type == "sci" => FileGrouping::PerRequest,
            _ => FileGrouping::Daily,
        }
    }

    /// Product identity at `level` for packets of `key`.
    pub fn identity(self, key: PacketKey, level: ProductLevel) -> ProductIdentity {
        match self.spec() {
            None => ProductIdentity {
                level,
                product_type: key.service_type.to_string(),
                name: match key.ssid {
                    Some(ssid) => format!("{}-{}", key.service_subtype, ssid),
                    None => key.service_subtype.to_string(),
                },
                ssid: key.ssid,
            },
            Some(spec) => ProductIdentity {
                level,
                product_type: spec.product_type.to_string(),
                name: spec.name.to_string(),
                ssid: spec.key.ssid,
            },
        }
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.spec() {
            None => f.write_str("level-binary"),
            Some(spec) => write!(f, "{}-{}", spec.product_type, spec.name),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KindError {
    #[error("packet key {key} is claimed by both {first} and {second}")]
    Ambiguous {
        key: PacketKey,
        first: ProductKind,
        second: ProductKind,
    },
}

/// Dispatch table from `(key, level)` to [`ProductKind`].
#[derive(Debug, Clone)]
pub struct KindRegistry {
    by_key: HashMap<PacketKey, ProductKind>,
}

impl KindRegistry {
    /// Build the table, failing if two kinds claim the same key.
    pub fn build() -> Result<Self, KindError> {
        let mut by_key = HashMap::with_capacity(KIND_TABLE.len());
        for spec in KIND_TABLE {
            if let Some(first) = by_key.insert(spec.key, spec.kind) {
                return Err(KindError::Ambiguous {
                    key: spec.key,
                    first,
                    second: spec.kind,
                });
            }
        }
        Ok(Self { by_key })
    }

    /// Kind for packets of `key` at `level`. Every key has a level binary
    /// kind; higher levels only exist for known keys.
    pub fn resolve(&self, key: PacketKey, level: ProductLevel) -> Option<ProductKind> {
        let kind = match level {
            ProductLevel::LB => ProductKind::LevelBinary,
            _ => *self.by_key.get(&key)?,
        };
        kind.matches(key.service_type, key.service_subtype, key.ssid, level)
            .then_some(kind)
    }

    /// Kind for an identity read back from an archived product.
    pub fn resolve_identity(&self, identity: &ProductIdentity) -> Option<ProductKind> {
        if identity.level == ProductLevel::LB {
            return Some(ProductKind::LevelBinary);
        }
        self.by_key.values().copied().find(|kind| {
            kind.spec()
                .map(|s| s.product_type == identity.product_type && s.name == identity.name)
                .unwrap_or(false)
        })
    }

    pub fn bypasses_sequencing(&self, key: &PacketKey) -> bool {
        self.by_key
            .get(key)
            .map(|kind| kind.bypasses_sequencing())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_unambiguous() {
        let registry = KindRegistry::build().unwrap();
        assert_eq!(registry.len(), KIND_TABLE.len());
    }

    #[test]
    fn test_resolve_by_level() {
        let registry = KindRegistry::build().unwrap();
        let key = PacketKey::new(21, 6, Some(30));
        assert_eq!(registry.resolve(key, ProductLevel::LB), Some(ProductKind::LevelBinary));
        assert_eq!(registry.resolve(key, ProductLevel::L1), Some(ProductKind::QlLightCurve));
        assert_eq!(registry.resolve(PacketKey::new(21, 6, Some(99)), ProductLevel::L1), None);
        assert_eq!(
            registry.resolve(PacketKey::new(21, 6, Some(99)), ProductLevel::LB),
            Some(ProductKind::LevelBinary)
        );
    }

    #[test]
    fn test_bypass_set() {
        let registry = KindRegistry::build().unwrap();
        for ssid in [30, 31, 32, 33, 34, 43] {
            assert!(registry.bypasses_sequencing(&PacketKey::new(21, 6, Some(ssid))));
        }
        assert!(registry.bypasses_sequencing(&PacketKey::new(3, 25, Some(1))));
        assert!(registry.bypasses_sequencing(&PacketKey::new(3, 25, Some(2))));
        assert!(!registry.bypasses_sequencing(&PacketKey::new(21, 6, Some(41))));
        assert!(!registry.bypasses_sequencing(&PacketKey::new(21, 6, Some(21))));
    }

    #[test]
    fn test_identity_and_policies() {
        let lb = ProductKind::LevelBinary.identity(PacketKey::new(21, 6, Some(24)), ProductLevel::LB);
        assert_eq!(lb.descriptor(), "stix-21-6-24");

        let cpd = ProductKind::SciXrayCpd.identity(PacketKey::new(21, 6, Some(21)), ProductLevel::L1);
        assert_eq!(cpd.descriptor(), "stix-sci-xray-cpd");
        assert_eq!(ProductKind::SciXrayCpd.control_key_policy(), ControlKeyPolicy::TimeAndRequest);
        assert_eq!(ProductKind::SciXrayCpd.file_grouping(), FileGrouping::PerRequest);
        assert_eq!(ProductKind::QlSpectra.control_key_policy(), ControlKeyPolicy::TimeOnly);
        assert_eq!(ProductKind::LevelBinary.control_key_policy(), ControlKeyPolicy::TimeAndSequence);

        let registry = KindRegistry::build().unwrap();
        assert_eq!(registry.resolve_identity(&cpd), Some(ProductKind::SciXrayCpd));
    }
}
