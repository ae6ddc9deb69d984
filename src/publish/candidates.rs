//! Publish candidate discovery
//!
//! Finds archived product files that are ready for publication: right level
//! and type, old enough to have settled, and of the selected version.

use super::PublishError;
use crate::types::{ProductFileName, ProductLevel};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Which version of each product to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelector {
    /// Highest version per product
    #[default]
    Latest,
    Exact(u32),
}

impl FromStr for VersionSelector {
    type Err = PublishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        s.trim_start_matches(['V', 'v'])
            .parse()
            .map(Self::Exact)
            .map_err(|_| PublishError::InvalidVersion(s.to_string()))
    }
}

/// Parse a waiting period such as `14d`, `12h`, `30m`, `45s` or `0`.
pub fn parse_waiting_period(text: &str) -> Result<Duration, PublishError> {
    let text = text.trim();
    let invalid = || PublishError::InvalidWaitingPeriod(text.to_string());
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let amount: i64 = digits.parse().map_err(|_| invalid())?;
    match unit {
        "d" => Ok(Duration::days(amount)),
        "h" => Ok(Duration::hours(amount)),
        "m" => Ok(Duration::minutes(amount)),
        "s" | "" => Ok(Duration::seconds(amount)),
        _ => Err(invalid()),
    }
}

/// Candidate selection rules.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    /// Empty means every level
    pub include_levels: Vec<ProductLevel>,
    /// Empty means every type
    pub include_types: Vec<String>,
    pub version: VersionSelector,
    pub include_incomplete: bool,
    /// Minimum age since last modification
    pub waiting_period: Duration,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self {
            include_levels: Vec::new(),
            include_types: Vec::new(),
            version: VersionSelector::Latest,
            include_incomplete: false,
            waiting_period: Duration::zero(),
        }
    }
}

impl CandidateFilter {
    fn accepts(&self, name: &ProductFileName, modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if !self.include_levels.is_empty() && !self.include_levels.contains(&name.level) {
            return false;
        }
        if !self.include_types.is_empty() {
            match name.product_type() {
                Some(t) if self.include_types.iter().any(|i| i == t) => {}
                _ => return false,
            }
        }
        if name.incomplete && !self.include_incomplete {
            return false;
        }
        if let VersionSelector::Exact(version) = self.version {
            if name.version != version {
                return false;
            }
        }
        modified + self.waiting_period <= now
    }
}

/// All publishable files under `root`, sorted by file name.
pub fn find_candidates(root: &Path, filter: &CandidateFilter, now: DateTime<Utc>) -> Result<Vec<PathBuf>, PublishError> {
    let mut files = Vec::new();
    collect_fits(root, &mut files)?;

    let mut accepted: Vec<(ProductFileName, PathBuf)> = Vec::new();
    for path in files {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(name) = file_name.parse::<ProductFileName>() else {
            debug!(path = %path.display(), "Skipping file outside the naming convention");
            continue;
        };
        let modified: DateTime<Utc> = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|e| PublishError::Io(path.clone(), e))?
            .into();
        if filter.accepts(&name, modified, now) {
            accepted.push((name, path));
        }
    }

    if filter.version == VersionSelector::Latest {
        let mut latest: HashMap<String, u32> = HashMap::new();
        for (name, _) in &accepted {
            let entry = latest.entry(name.version_stem()).or_insert(name.version);
            *entry = (*entry).max(name.version);
        }
        accepted.retain(|(name, _)| latest.get(&name.version_stem()) == Some(&name.version));
    }

    let mut paths: Vec<PathBuf> = accepted.into_iter().map(|(_, p)| p).collect();
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

fn collect_fits(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), PublishError> {
    let entries = fs::read_dir(dir).map_err(|e| PublishError::Io(dir.to_path_buf(), e))?;
    for entry in entries {
        let path = entry.map_err(|e| PublishError::Io(dir.to_path_buf(), e))?.path();
        if path.is_dir() {
            collect_fits(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "fits") {
            out.push(path);
        }
    }
    Ok(())
}
