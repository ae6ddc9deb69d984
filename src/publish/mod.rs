//! Publishing to the downstream archive
//!
//! Candidate discovery, the operator blacklist, the conflict resolver that
//! decides each file's fate, and the reports a publish run leaves behind.

pub mod blacklist;
pub mod candidates;
pub mod report;
pub mod resolver;

pub use blacklist::Blacklist;
pub use candidates::{find_candidates, parse_waiting_period, CandidateFilter, VersionSelector};
pub use report::{PublishSummary, SupplementReport};
pub use resolver::{
    DecisionReason, PublishConflictResolver, PublishDecision, PublishSettings, DEFAULT_MAX_SUPPLEMENTS,
};

use crate::products::FormatError;
use crate::storage::StorageError;
use crate::types::NamingError;
use std::path::PathBuf;
use thiserror::Error;

/// Publishing errors
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("not a usable candidate path: {0}")]
    InvalidCandidate(PathBuf),

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("publish history: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid blacklist: {0}")]
    Blacklist(String),

    #[error("invalid waiting period '{0}' (expected e.g. 14d, 12h, 30m, 0s)")]
    InvalidWaitingPeriod(String),

    #[error("invalid version selector '{0}' (expected 'latest' or a number)")]
    InvalidVersion(String),

    #[error("supplement report: {0}")]
    Report(String),
}
