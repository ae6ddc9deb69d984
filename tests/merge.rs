//! Merge-on-append Tests
//!
//! Drives ProductMerger through the archive: decoded level binary products
//! from overlapping telemetry dumps are stored into the same daily file and
//! must never duplicate a packet.

use std::path::Path;
use stix_pipeline::acquisition::{encode_packet, parse_bytes, sequence_packets, PacketFields};
use stix_pipeline::products::{
    ControlKeyPolicy, DecoderRegistry, KindRegistry, ProductArchive, ProductKind, ProductMerger,
};
use stix_pipeline::types::{
    ControlRow, DataRow, PacketKey, Product, ProductIdentity, ProductLevel, SCETime, SCETimeRange, SequenceFlag,
};
use tempfile::tempdir;

const HK_MINI: PacketKey = PacketKey::new(3, 25, Some(1));

/// Level binary product of standalone packets at the given seconds.
fn level_binary(seconds: std::ops::RangeInclusive<u32>, source: &str) -> Product {
    let bytes: Vec<u8> = seconds
        .flat_map(|s| {
            encode_packet(&PacketFields {
                key: HK_MINI,
                sequence_flag: SequenceFlag::Standalone,
                sequence_count: s as u16,
                raw_coarse: s,
                fine: 0,
                body: vec![s as u8; 12],
            })
        })
        .collect();
    let kinds = KindRegistry::build().unwrap();
    let parsed = parse_bytes(&bytes, Path::new(source));
    let sequences = sequence_packets(parsed.packets, |k| kinds.bypasses_sequencing(k));
    DecoderRegistry::with_level_binary()
        .decode(ProductKind::LevelBinary, ProductLevel::LB, &sequences.complete)
        .unwrap()
}

fn sequence_counts(product: &Product) -> Vec<Option<u16>> {
    product.control().iter().map(|r| r.sequence_count).collect()
}

// ============================================================================
// Level binary through the archive
// ============================================================================

#[test]
fn overlapping_dumps_merge_without_duplicates() {
    let dir = tempdir().unwrap();
    let archive = ProductArchive::envelope(dir.path(), 1);

    let first = archive
        .store(ProductKind::LevelBinary, &level_binary(1..=5, "a.bin"), false)
        .unwrap();
    let second = archive
        .store(ProductKind::LevelBinary, &level_binary(3..=8, "b.bin"), false)
        .unwrap();
    assert_eq!(first, second, "both dumps belong in the same daily file");

    let merged = archive.read(&first[0]).unwrap();
    assert_eq!(merged.control().len(), 8);
    assert_eq!(merged.data().len(), 8);
    assert_eq!(sequence_counts(&merged), (1..=8).map(Some).collect::<Vec<_>>());
    assert_eq!(merged.scet_range().start(), SCETime::from_parts(1, 0));
    assert_eq!(merged.scet_range().end(), SCETime::from_parts(8, 0));

    // Overlapping rows keep the first source.
    assert_eq!(merged.control()[3].raw_file, "a.bin");
    assert_eq!(merged.control()[5].raw_file, "b.bin");
}

#[test]
fn storing_the_same_dump_twice_is_idempotent() {
    let dir = tempdir().unwrap();
    let archive = ProductArchive::envelope(dir.path(), 1);
    let product = level_binary(10..=20, "a.bin");

    let paths = archive.store(ProductKind::LevelBinary, &product, false).unwrap();
    let once = archive.read(&paths[0]).unwrap();
    archive.store(ProductKind::LevelBinary, &product, false).unwrap();
    let twice = archive.read(&paths[0]).unwrap();

    assert_eq!(once.control(), twice.control());
    assert_eq!(once.data(), twice.data());
}

#[test]
fn dumps_on_different_days_go_to_different_files() {
    let dir = tempdir().unwrap();
    let archive = ProductArchive::envelope(dir.path(), 1);
    let product = level_binary(86_398..=86_401, "a.bin");

    let paths = archive.store(ProductKind::LevelBinary, &product, false).unwrap();
    assert_eq!(paths.len(), 2);
    let rows: usize = paths.iter().map(|p| archive.read(p).unwrap().data().len()).sum();
    assert_eq!(rows, 4);
}

// ============================================================================
// Request-keyed science products
// ============================================================================

fn science(rows: &[(u32, u32)]) -> Product {
    let identity = ProductKind::SciXraySpec.identity(PacketKey::new(21, 6, Some(24)), ProductLevel::L1);
    let control = rows
        .iter()
        .enumerate()
        .map(|(i, &(coarse, request))| ControlRow {
            index: i as u32,
            scet_coarse: coarse,
            scet_fine: 0,
            sequence_count: None,
            request_id: Some(request),
            data_length: None,
            integration_time: 4.0,
            raw_file: "sci.bin".to_string(),
        })
        .collect();
    let data = rows
        .iter()
        .enumerate()
        .map(|(i, &(coarse, _))| DataRow {
            control_index: i as u32,
            time: f64::from(coarse),
            timedel: 4.0,
            counts: vec![1.0, 2.0, 3.0],
            packet: None,
        })
        .collect();
    let range = SCETimeRange::new(SCETime::from_parts(0, 0), SCETime::from_parts(100, 0)).unwrap();
    Product::new(identity, control, data, [("2.26.35".to_string(), range)].into()).unwrap()
}

#[test]
fn request_policy_keeps_distinct_requests_at_same_time() {
    let merger = ProductMerger::for_kind(ProductKind::SciXraySpec);
    let existing = science(&[(10, 1), (20, 1)]);
    let incoming = science(&[(10, 2), (20, 1)]);

    let merged = merger.merge(&existing, &incoming).unwrap();
    assert_eq!(merged.control().len(), 3);
    let requests: Vec<Option<u32>> = merged.control().iter().map(|r| r.request_id).collect();
    assert_eq!(requests, vec![Some(1), Some(2), Some(1)]);
    assert_eq!(merged.data().len(), 3);
}

#[test]
fn time_only_policy_collapses_same_timestamp() {
    let merger = ProductMerger::new(ControlKeyPolicy::TimeOnly);
    let existing = science(&[(10, 1)]);
    let incoming = science(&[(10, 2)]);
    let merged = merger.merge(&existing, &incoming).unwrap();
    assert_eq!(merged.control().len(), 1);
    assert_eq!(merged.control()[0].request_id, Some(1));
}

#[test]
fn merging_different_kinds_is_rejected() {
    let merger = ProductMerger::new(ControlKeyPolicy::TimeAndSequence);
    let hk = level_binary(1..=2, "a.bin");
    let mut other = ProductIdentity {
        name: "25-2".to_string(),
        ..hk.identity.clone()
    };
    other.ssid = Some(2);
    let renamed = Product::new(other, hk.control().to_vec(), hk.data().to_vec(), hk.idb_versions().clone()).unwrap();
    assert!(merger.merge(&hk, &renamed).is_err());
}
