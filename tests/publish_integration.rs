//! Publish Integration Tests
//!
//! Archive products, discover candidates and run them through the conflict
//! resolver against a persistent publish history, the way a publish run
//! does end to end.

use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use stix_pipeline::products::{EnvelopeFormat, ProductArchive, ProductFormat, ProductKind};
use stix_pipeline::publish::{
    find_candidates, Blacklist, CandidateFilter, DecisionReason, PublishConflictResolver, PublishSettings,
    SupplementReport, VersionSelector,
};
use stix_pipeline::storage::{Ledgers, PublishResult};
use stix_pipeline::types::{ControlRow, DataRow, PacketKey, Product, ProductLevel};
use tempfile::{tempdir, TempDir};

const LIGHTCURVE: PacketKey = PacketKey::new(21, 6, Some(30));

struct Setup {
    dir: TempDir,
    ledgers: Ledgers,
}

impl Setup {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let ledgers = Ledgers::open(dir.path().join("ledger")).unwrap();
        Self { dir, ledgers }
    }

    fn archive(&self, version: u32) -> ProductArchive {
        ProductArchive::envelope(self.dir.path().join("archive"), version)
    }

    fn settings(&self) -> PublishSettings {
        PublishSettings {
            target_dir: self.dir.path().join("target"),
            review_dir: self.dir.path().join("review"),
            max_supplements: 2,
            stop_on_error: false,
        }
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let filter = CandidateFilter {
            include_levels: vec![ProductLevel::L1],
            ..CandidateFilter::default()
        };
        find_candidates(&self.dir.path().join("archive"), &filter, Utc::now() + Duration::seconds(5)).unwrap()
    }

    fn target(&self, name: &str) -> PathBuf {
        self.dir.path().join("target").join(name)
    }
}

/// Quick-look light curve with one sample per listed second.
fn lightcurve(seconds: &[u32], level: f64) -> Product {
    let identity = ProductKind::QlLightCurve.identity(LIGHTCURVE, ProductLevel::L1);
    let control = seconds
        .iter()
        .enumerate()
        .map(|(i, &s)| ControlRow {
            index: i as u32,
            scet_coarse: s,
            scet_fine: 0,
            sequence_count: None,
            request_id: None,
            data_length: None,
            integration_time: 4.0,
            raw_file: "tm.bin".to_string(),
        })
        .collect();
    let data = seconds
        .iter()
        .enumerate()
        .map(|(i, &s)| DataRow {
            control_index: i as u32,
            time: f64::from(s),
            timedel: 4.0,
            counts: vec![level; 5],
            packet: None,
        })
        .collect();
    Product::new(identity, control, data, BTreeMap::new()).unwrap()
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

/// Write a copy of `product` under a name that carries a free field.
fn write_variant(dir: &Path, product: &Product, name: &str) -> PathBuf {
    let path = dir.join("reprocessed").join(name);
    EnvelopeFormat
        .write(product, &EnvelopeFormat::header(name, 1, false), &path)
        .unwrap();
    path
}

// ============================================================================
// Archive to target
// ============================================================================

#[test]
fn archived_product_is_published_once() {
    let setup = Setup::new();
    let archive = setup.archive(1);
    let stored = archive
        .store(ProductKind::QlLightCurve, &lightcurve(&[0, 4, 8], 1.0), false)
        .unwrap();
    let name = file_name(&stored[0]);
    assert_eq!(name, "solo_L1_stix-ql-lightcurve_0000000000_V01.fits");

    let candidates = setup.candidates();
    assert_eq!(candidates, stored);

    let resolver = PublishConflictResolver::new(&setup.ledgers.publish, archive.format(), setup.settings());
    let summary = resolver.publish(&candidates).unwrap();
    assert_eq!(summary.count(PublishResult::Published), 1);
    assert!(setup.target(&name).exists());

    let rerun = resolver.publish(&candidates).unwrap();
    assert_eq!(rerun.count(PublishResult::Ignored), 1);
    assert_eq!(rerun.same_name, 1);
    assert_eq!(setup.ledgers.publish.count(), 1);
}

#[test]
fn only_latest_version_is_a_candidate() {
    let setup = Setup::new();
    let product = lightcurve(&[0, 4], 1.0);
    setup.archive(1).store(ProductKind::QlLightCurve, &product, false).unwrap();
    setup.archive(2).store(ProductKind::QlLightCurve, &product, false).unwrap();

    let names: Vec<String> = setup.candidates().iter().map(|p| file_name(p)).collect();
    assert_eq!(names, vec!["solo_L1_stix-ql-lightcurve_0000000000_V02.fits"]);

    let filter = CandidateFilter {
        version: VersionSelector::Exact(1),
        ..CandidateFilter::default()
    };
    let pinned = find_candidates(&setup.dir.path().join("archive"), &filter, Utc::now() + Duration::seconds(5)).unwrap();
    assert_eq!(pinned.len(), 1);
    assert!(file_name(&pinned[0]).contains("_V01"));
}

#[test]
fn incomplete_products_wait_unless_included() {
    let setup = Setup::new();
    setup
        .archive(1)
        .store(ProductKind::QlLightCurve, &lightcurve(&[0], 1.0), true)
        .unwrap();
    assert!(setup.candidates().is_empty());

    let filter = CandidateFilter {
        include_incomplete: true,
        ..CandidateFilter::default()
    };
    let found = find_candidates(&setup.dir.path().join("archive"), &filter, Utc::now() + Duration::seconds(5)).unwrap();
    assert_eq!(found.len(), 1);
    assert!(file_name(&found[0]).ends_with("_V01U.fits"));
}

// ============================================================================
// Conflicts under one ESA name
// ============================================================================

#[test]
fn changed_content_becomes_supplements_then_review() {
    let setup = Setup::new();
    let archive = setup.archive(1);
    let report_path = setup.dir.path().join("reports").join("supplements.jsonl");

    let base = lightcurve(&[0, 4], 1.0);
    let mut candidates = archive.store(ProductKind::QlLightCurve, &base, false).unwrap();
    // Same ESA name, same payload under a different free field.
    candidates.push(write_variant(
        setup.dir.path(),
        &base,
        "solo_L1_stix-ql-lightcurve_0000000000_V01_a.fits",
    ));
    for (i, tag) in ["b", "c", "d"].iter().enumerate() {
        candidates.push(write_variant(
            setup.dir.path(),
            &lightcurve(&[0, 4], 2.0 + i as f64),
            &format!("solo_L1_stix-ql-lightcurve_0000000000_V01_{}.fits", tag),
        ));
    }

    let resolver = PublishConflictResolver::new(&setup.ledgers.publish, archive.format(), setup.settings())
        .with_report(SupplementReport::new(&report_path));
    let decisions: Vec<_> = {
        let mut ordered = candidates.clone();
        ordered.sort_by_key(|p| file_name(p));
        ordered.iter().map(|c| resolver.resolve(c).unwrap()).collect()
    };

    let reasons: Vec<DecisionReason> = decisions.iter().map(|d| d.reason).collect();
    assert_eq!(
        reasons,
        vec![
            DecisionReason::Added,
            DecisionReason::SameContent,
            DecisionReason::Supplement(1),
            DecisionReason::Supplement(2),
            DecisionReason::MaxSupplement,
        ]
    );
    assert!(setup
        .target("solo_L1_stix-ql-lightcurve-sup1_0000000000_V01_b.fits")
        .exists());
    assert!(setup
        .target("solo_L1_stix-ql-lightcurve-sup2_0000000000_V01_c.fits")
        .exists());
    assert!(setup
        .dir
        .path()
        .join("review")
        .join("solo_L1_stix-ql-lightcurve_0000000000_V01_d.fits")
        .exists());

    let group = setup
        .ledgers
        .publish
        .group("solo_L1_stix-ql-lightcurve_0000000000_V01")
        .unwrap();
    let results: Vec<PublishResult> = group.iter().map(|r| r.result).collect();
    assert_eq!(
        results,
        vec![
            PublishResult::Published,
            PublishResult::Ignored,
            PublishResult::Modified,
            PublishResult::Modified,
            PublishResult::Error,
        ]
    );

    let report = std::fs::read_to_string(&report_path).unwrap();
    assert_eq!(report.lines().count(), 3);
    assert!(report.contains("max supplement error"));
}

#[test]
fn blacklisted_files_are_recorded_but_not_copied() {
    let setup = Setup::new();
    let archive = setup.archive(1);
    let stored = archive
        .store(ProductKind::QlLightCurve, &lightcurve(&[0], 1.0), false)
        .unwrap();

    let blacklist = Blacklist::parse("# withheld pending calibration\nsolo_L1_stix-ql-.*\n").unwrap();
    let resolver = PublishConflictResolver::new(&setup.ledgers.publish, archive.format(), setup.settings())
        .with_blacklist(blacklist);
    let summary = resolver.publish(&stored).unwrap();

    assert_eq!(summary.count(PublishResult::Blacklisted), 1);
    assert!(!setup.target(&file_name(&stored[0])).exists());
    let row = setup.ledgers.publish.get(&file_name(&stored[0])).unwrap().unwrap();
    assert_eq!(row.result, PublishResult::Blacklisted);
}
