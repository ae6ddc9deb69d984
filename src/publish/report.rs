//! Publish reports
//!
//! The supplement report is a JSON-lines file with one entry per file that
//! was renamed into a supplement or parked for review. The run summary is
//! logged at the end of every publish run.

use super::resolver::{DecisionReason, PublishDecision};
use super::PublishError;
use crate::storage::PublishResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Serialize)]
struct SupplementEntry<'a> {
    name: &'a str,
    esa_name: &'a str,
    modified_name: Option<&'a str>,
    result: PublishResult,
    reason: String,
    at: DateTime<Utc>,
}

/// Append-only supplement report.
#[derive(Debug, Clone)]
pub struct SupplementReport {
    path: PathBuf,
}

impl SupplementReport {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a decision if it is a supplement or a parked file.
    pub fn record(&self, decision: &PublishDecision) -> Result<(), PublishError> {
        if !matches!(decision.reason, DecisionReason::Supplement(_) | DecisionReason::MaxSupplement) {
            return Ok(());
        }
        let entry = SupplementEntry {
            name: &decision.name,
            esa_name: &decision.esa_name,
            modified_name: decision.modified_name.as_deref(),
            result: decision.result,
            reason: decision.reason.to_string(),
            at: Utc::now(),
        };
        let line = serde_json::to_string(&entry).map_err(|e| PublishError::Report(e.to_string()))?;

        let io_err = |e| PublishError::Io(self.path.clone(), e);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{}", line).map_err(io_err)?;
        Ok(())
    }
}

/// Counts per outcome and reason for one publish run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub by_result: BTreeMap<PublishResult, usize>,
    /// Candidates that failed with an infrastructure error (not persisted)
    pub failed: usize,
    pub same_name: usize,
    pub same_content: usize,
    pub added: usize,
    pub supplements: usize,
}

impl PublishSummary {
    pub fn record(&mut self, decision: &PublishDecision) {
        *self.by_result.entry(decision.result).or_default() += 1;
        match decision.reason {
            DecisionReason::SameExists => self.same_name += 1,
            DecisionReason::SameContent => self.same_content += 1,
            DecisionReason::Added => self.added += 1,
            DecisionReason::Supplement(_) => self.supplements += 1,
            DecisionReason::MaxSupplement | DecisionReason::Blacklisted => {}
        }
    }

    pub fn count(&self, result: PublishResult) -> usize {
        self.by_result.get(&result).copied().unwrap_or(0)
    }

    pub fn errors(&self) -> usize {
        self.failed + self.count(PublishResult::Error)
    }

    /// Log the run summary.
    pub fn log(&self) {
        info!(
            "Publish summary: E {} C {} D {} A {}",
            self.errors(),
            self.same_name,
            self.same_content,
            self.added
        );
        info!(
            published = self.count(PublishResult::Published),
            ignored = self.count(PublishResult::Ignored),
            modified = self.count(PublishResult::Modified),
            blacklisted = self.count(PublishResult::Blacklisted),
            error = self.count(PublishResult::Error),
            failed = self.failed,
            "Publish outcomes"
        );
    }
}
