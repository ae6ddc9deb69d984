//! Publish Conflict Resolver
//!
//! Classifies every finished file relative to everything published before:
//!
//! 1. exact file name already in the history: `IGNORED` (nothing written)
//! 2. blacklisted: `BLACKLISTED`, not copied
//! 3. no other file shares the ESA name: copy, `PUBLISHED`
//! 4. any file with the same ESA name has an identical payload, whatever
//!    its own outcome was: `IGNORED`
//! 5. otherwise the file is a supplement `N` (`MODIFIED` rows so far plus
//!    one). Past the cap it is parked in the review directory as `ERROR`;
//!    else it is copied under a `-sup{N}` name as `MODIFIED`.
//!
//! Candidates run one at a time in file-name order and each decision is
//! persisted before the next candidate is looked at. The copy happens before
//! the row is written; a crash in between repeats the same copy to the same
//! path on the next run. Infrastructure failures persist nothing, so the
//! candidate is retried next run. The supplement report is written after
//! the row; a report failure is logged and the decision stands.

use super::blacklist::Blacklist;
use super::report::{PublishSummary, SupplementReport};
use super::PublishError;
use crate::products::ProductFormat;
use crate::storage::{PublishHistoryStorage, PublishRecord, PublishResult};
use crate::types::ProductFileName;
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Default number of supplements allowed per ESA name.
pub const DEFAULT_MAX_SUPPLEMENTS: u32 = 2;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    SameExists,
    Added,
    SameContent,
    Supplement(u32),
    MaxSupplement,
    Blacklisted,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SameExists => f.write_str("same name exists"),
            Self::Added => f.write_str("added"),
            Self::SameContent => f.write_str("same content under this ESA name"),
            Self::Supplement(n) => write!(f, "supplement {}", n),
            Self::MaxSupplement => f.write_str("max supplement error"),
            Self::Blacklisted => f.write_str("blacklisted"),
        }
    }
}

/// Outcome for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishDecision {
    pub name: String,
    pub esa_name: String,
    pub result: PublishResult,
    pub reason: DecisionReason,
    /// File name the candidate was delivered under when renamed
    pub modified_name: Option<String>,
    /// Where the copy went (target or review directory)
    pub delivered_to: Option<PathBuf>,
}

/// Where files go and how many supplements are allowed.
#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub target_dir: PathBuf,
    /// Side channel for files that need manual review
    pub review_dir: PathBuf,
    pub max_supplements: u32,
    /// Abort the run on the first infrastructure error
    pub stop_on_error: bool,
}

pub struct PublishConflictResolver<'a> {
    history: &'a PublishHistoryStorage,
    format: &'a dyn ProductFormat,
    settings: PublishSettings,
    blacklist: Blacklist,
    report: Option<SupplementReport>,
}

impl<'a> PublishConflictResolver<'a> {
    pub fn new(history: &'a PublishHistoryStorage, format: &'a dyn ProductFormat, settings: PublishSettings) -> Self {
        Self {
            history,
            format,
            settings,
            blacklist: Blacklist::default(),
            report: None,
        }
    }

    pub fn with_blacklist(mut self, blacklist: Blacklist) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn with_report(mut self, report: SupplementReport) -> Self {
        self.report = Some(report);
        self
    }

    /// Decide every candidate in file-name order.
    pub fn publish(&self, candidates: &[PathBuf]) -> Result<PublishSummary, PublishError> {
        let mut ordered: Vec<&PathBuf> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut summary = PublishSummary::default();
        for candidate in ordered {
            match self.resolve(candidate) {
                Ok(decision) => {
                    info!(
                        file = %decision.name,
                        result = %decision.result,
                        reason = %decision.reason,
                        "Publish decision"
                    );
                    summary.record(&decision);
                }
                Err(e) => {
                    error!(file = %candidate.display(), error = %e, "Publishing failed");
                    summary.failed += 1;
                    if self.settings.stop_on_error {
                        summary.log();
                        return Err(e);
                    }
                }
            }
        }
        self.history.flush()?;
        summary.log();
        Ok(summary)
    }

    /// Decide, deliver and persist one candidate.
    pub fn resolve(&self, candidate: &Path) -> Result<PublishDecision, PublishError> {
        let file_name = candidate
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PublishError::InvalidCandidate(candidate.to_path_buf()))?
            .to_string();
        let parsed: ProductFileName = file_name.parse()?;
        let esa_name = parsed.esa_name();

        let mut decision = PublishDecision {
            name: file_name.clone(),
            esa_name: esa_name.clone(),
            result: PublishResult::Ignored,
            reason: DecisionReason::SameExists,
            modified_name: None,
            delivered_to: None,
        };
        if self.history.contains(&file_name)? {
            return Ok(decision);
        }

        let modified_at: DateTime<Utc> = fs::metadata(candidate)
            .and_then(|m| m.modified())
            .map_err(|e| PublishError::Io(candidate.to_path_buf(), e))?
            .into();
        let payload = self.format.read_payload(candidate)?;
        let digest = format!("{:x}", md5::compute(&payload));

        if self.blacklist.matches(&file_name) {
            decision.result = PublishResult::Blacklisted;
            decision.reason = DecisionReason::Blacklisted;
        } else {
            let group: Vec<PublishRecord> = self.history.group(&esa_name)?;

            if group.is_empty() {
                let target = self.deliver(candidate, &self.settings.target_dir, &file_name)?;
                decision.result = PublishResult::Published;
                decision.reason = DecisionReason::Added;
                decision.delivered_to = Some(target);
            } else if group.iter().any(|row| self.same_content(row, &digest, &payload)) {
                decision.reason = DecisionReason::SameContent;
            } else {
                let supplements = group
                    .iter()
                    .filter(|row| row.result == PublishResult::Modified)
                    .count() as u32;
                let number = supplements + 1;
                if number > self.settings.max_supplements {
                    warn!(
                        file = %file_name,
                        esa_name = %esa_name,
                        supplement = number,
                        max = self.settings.max_supplements,
                        "Max supplements exceeded, parking file for review"
                    );
                    let parked = self.deliver(candidate, &self.settings.review_dir, &file_name)?;
                    decision.result = PublishResult::Error;
                    decision.reason = DecisionReason::MaxSupplement;
                    decision.delivered_to = Some(parked);
                } else {
                    let renamed = parsed.with_supplement(number).file_name();
                    let target = self.deliver(candidate, &self.settings.target_dir, &renamed)?;
                    decision.result = PublishResult::Modified;
                    decision.reason = DecisionReason::Supplement(number);
                    decision.modified_name = Some(renamed);
                    decision.delivered_to = Some(target);
                }
            }
        }

        let record = PublishRecord {
            name: file_name.clone(),
            path: decision
                .delivered_to
                .clone()
                .unwrap_or_else(|| candidate.to_path_buf()),
            version: parsed.version,
            published_at: Utc::now(),
            modified_at,
            esa_name,
            modified_esa_name: decision
                .modified_name
                .as_deref()
                .and_then(|n| n.parse::<ProductFileName>().ok())
                .map(|n| n.esa_name()),
            result: decision.result,
            payload_digest: Some(digest),
            seq: 0,
        };
        if !self.history.add(&record)? {
            // Another writer decided this name between our check and insert.
            decision.result = PublishResult::Ignored;
            decision.reason = DecisionReason::SameExists;
            return Ok(decision);
        }

        if let Some(report) = &self.report {
            if let Err(e) = report.record(&decision) {
                warn!(file = %decision.name, error = %e, "Failed to append to supplement report");
            }
        }
        Ok(decision)
    }

    fn same_content(&self, row: &PublishRecord, digest: &str, payload: &[u8]) -> bool {
        if row.payload_digest.as_deref() != Some(digest) {
            return false;
        }
        match self.format.read_payload(&row.path) {
            Ok(existing) => existing == payload,
            // Copy moved on downstream; the digest stands in for it.
            Err(_) => true,
        }
    }

    fn deliver(&self, source: &Path, dir: &Path, file_name: &str) -> Result<PathBuf, PublishError> {
        fs::create_dir_all(dir).map_err(|e| PublishError::Io(dir.to_path_buf(), e))?;
        let target = dir.join(file_name);
        fs::copy(source, &target).map_err(|e| PublishError::Io(target.clone(), e))?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::products::{EnvelopeFormat, ProductFormat};
    use crate::types::{ControlRow, DataRow, Product, ProductIdentity, ProductLevel};
    use std::collections::BTreeMap;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        history: PublishHistoryStorage,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let history = PublishHistoryStorage::open(dir.path().join("ledger")).unwrap();
            Self { dir, history }
        }

        fn settings(&self) -> PublishSettings {
            PublishSettings {
                target_dir: self.dir.path().join("target"),
                review_dir: self.dir.path().join("review"),
                max_supplements: DEFAULT_MAX_SUPPLEMENTS,
                stop_on_error: false,
            }
        }

        fn candidate(&self, name: &str, counts: f64) -> PathBuf {
            let identity = ProductIdentity {
                level: ProductLevel::L1,
                product_type: "ql".to_string(),
                name: "lightcurve".to_string(),
                ssid: Some(30),
            };
            let control = vec![ControlRow {
                index: 0,
                scet_coarse: 0,
                scet_fine: 0,
                sequence_count: None,
                request_id: None,
                data_length: None,
                integration_time: 4.0,
                raw_file: String::new(),
            }];
            let data = vec![DataRow {
                control_index: 0,
                time: 0.0,
                timedel: 4.0,
                counts: vec![counts],
                packet: None,
            }];
            let product = Product::new(identity, control, data, BTreeMap::new()).unwrap();
            let path = self.dir.path().join("out").join(name);
            EnvelopeFormat
                .write(&product, &EnvelopeFormat::header(name, 1, false), &path)
                .unwrap();
            path
        }
    }

    const ESA: &str = "solo_L1_stix-ql-lightcurve_0000000000_V01";

    #[test]
    fn test_same_name_twice() {
        let fx = Fixture::new();
        let resolver = PublishConflictResolver::new(&fx.history, &EnvelopeFormat, fx.settings());
        let file = fx.candidate(&format!("{}_1.fits", ESA), 1.0);

        assert_eq!(resolver.resolve(&file).unwrap().result, PublishResult::Published);
        assert_eq!(fx.history.count(), 1);
        let again = resolver.resolve(&file).unwrap();
        assert_eq!(again.result, PublishResult::Ignored);
        assert_eq!(again.reason, DecisionReason::SameExists);
        assert_eq!(fx.history.count(), 1);
    }

    #[test]
    fn test_supplements_then_cap() {
        let fx = Fixture::new();
        let resolver = PublishConflictResolver::new(&fx.history, &EnvelopeFormat, fx.settings());
        let results: Vec<PublishDecision> = (1..=4)
            .map(|i| {
                let file = fx.candidate(&format!("{}_{}.fits", ESA, i), f64::from(i));
                resolver.resolve(&file).unwrap()
            })
            .collect();

        let outcomes: Vec<PublishResult> = results.iter().map(|d| d.result).collect();
        assert_eq!(
            outcomes,
            vec![
                PublishResult::Published,
                PublishResult::Modified,
                PublishResult::Modified,
                PublishResult::Error
            ]
        );
        assert_eq!(
            results[1].modified_name.as_deref(),
            Some("solo_L1_stix-ql-lightcurve-sup1_0000000000_V01_2.fits")
        );
        assert_eq!(
            results[2].modified_name.as_deref(),
            Some("solo_L1_stix-ql-lightcurve-sup2_0000000000_V01_3.fits")
        );
        assert!(fx.dir.path().join("review").join(format!("{}_4.fits", ESA)).exists());
        assert!(!fx.dir.path().join("target").join(format!("{}_4.fits", ESA)).exists());
        assert_eq!(
            fx.history.get(&format!("{}_2.fits", ESA)).unwrap().unwrap().modified_esa_name.as_deref(),
            Some("solo_L1_stix-ql-lightcurve-sup1_0000000000_V01")
        );
    }

    #[test]
    fn test_identical_payload_ignored() {
        let fx = Fixture::new();
        let resolver = PublishConflictResolver::new(&fx.history, &EnvelopeFormat, fx.settings());
        let a = fx.candidate(&format!("{}_1.fits", ESA), 5.0);
        let b = fx.candidate(&format!("{}_2.fits", ESA), 5.0);

        assert_eq!(resolver.resolve(&a).unwrap().result, PublishResult::Published);
        let second = resolver.resolve(&b).unwrap();
        assert_eq!(second.result, PublishResult::Ignored);
        assert_eq!(second.reason, DecisionReason::SameContent);
        assert_eq!(fx.history.count(), 2);
    }

    #[test]
    fn test_blacklist_overrides() {
        let fx = Fixture::new();
        let blacklist = Blacklist::parse(&format!("{}_1\\.fits", ESA)).unwrap();
        let resolver =
            PublishConflictResolver::new(&fx.history, &EnvelopeFormat, fx.settings()).with_blacklist(blacklist);
        let file = fx.candidate(&format!("{}_1.fits", ESA), 1.0);
        let decision = resolver.resolve(&file).unwrap();
        assert_eq!(decision.result, PublishResult::Blacklisted);
        assert!(decision.delivered_to.is_none());
        assert!(!fx.dir.path().join("target").exists());

        // The blacklisted row still occupies the ESA name.
        let other = fx.candidate(&format!("{}_2.fits", ESA), 2.0);
        let decision = resolver.resolve(&other).unwrap();
        assert_eq!(decision.result, PublishResult::Modified);
        assert_eq!(decision.reason, DecisionReason::Supplement(1));

        let same_as_blacklisted = fx.candidate(&format!("{}_3.fits", ESA), 1.0);
        assert_eq!(resolver.resolve(&same_as_blacklisted).unwrap().reason, DecisionReason::SameContent);
    }

    #[test]
    fn test_repeat_of_parked_file_ignored() {
        let fx = Fixture::new();
        let resolver = PublishConflictResolver::new(&fx.history, &EnvelopeFormat, fx.settings());
        let counts = [1.0, 2.0, 3.0, 4.0, 4.0];
        let outcomes: Vec<(PublishResult, DecisionReason)> = counts
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let file = fx.candidate(&format!("{}_{}.fits", ESA, i + 1), c);
                let d = resolver.resolve(&file).unwrap();
                (d.result, d.reason)
            })
            .collect();

        assert_eq!(
            outcomes,
            vec![
                (PublishResult::Published, DecisionReason::Added),
                (PublishResult::Modified, DecisionReason::Supplement(1)),
                (PublishResult::Modified, DecisionReason::Supplement(2)),
                (PublishResult::Error, DecisionReason::MaxSupplement),
                (PublishResult::Ignored, DecisionReason::SameContent),
            ]
        );
        let parked = fs::read_dir(fx.dir.path().join("review")).unwrap().count();
        assert_eq!(parked, 1);
    }

    #[test]
    fn test_report_failure_keeps_decision() {
        let fx = Fixture::new();
        // The report path sits below a regular file, so appending fails.
        let blocker = fx.dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let report = SupplementReport::new(blocker.join("supplements.jsonl"));
        let resolver =
            PublishConflictResolver::new(&fx.history, &EnvelopeFormat, fx.settings()).with_report(report);

        let first = fx.candidate(&format!("{}_1.fits", ESA), 1.0);
        let second = fx.candidate(&format!("{}_2.fits", ESA), 2.0);
        let summary = resolver.publish(&[first, second]).unwrap();
        assert_eq!(summary.failed, 0);
        assert_eq!(
            fx.history.get(&format!("{}_2.fits", ESA)).unwrap().unwrap().result,
            PublishResult::Modified
        );
        assert!(fx
            .dir
            .path()
            .join("target/solo_L1_stix-ql-lightcurve-sup1_0000000000_V01_2.fits")
            .exists());
    }

    #[test]
    fn test_unreadable_candidate_not_persisted() {
        let fx = Fixture::new();
        let resolver = PublishConflictResolver::new(&fx.history, &EnvelopeFormat, fx.settings());
        let missing = fx.dir.path().join(format!("{}_9.fits", ESA));
        let summary = resolver.publish(&[missing]).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(fx.history.count(), 0);
    }
}
