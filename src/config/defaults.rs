//! Built-in default values.
//!
//! Grouped by config section.

// ============================================================================
// Paths
// ============================================================================

pub const TM_DIR: &str = "data/tm";
pub const ARCHIVE_DIR: &str = "data/archive";
pub const LEDGER_DIR: &str = "data/ledger";

// ============================================================================
// Pipeline
// ============================================================================

pub const WORKERS: usize = 4;

/// Inputs per sub-batch handed to one worker.
pub const BATCH_SIZE: usize = 50;

pub const PRODUCT_VERSION: u32 = 1;

/// Raw telemetry file names the watcher picks up.
pub const TM_FILE_PATTERN: &str = r"^.+\.(bin|tm)$";

pub const POLL_INTERVAL_SECS: u64 = 5;

/// Seconds a file must stay unchanged before it is ingested.
pub const SETTLE_SECS: u64 = 10;

pub const QUEUE_CAPACITY: usize = 64;

// ============================================================================
// Publish
// ============================================================================

pub const TARGET_DIR: &str = "data/publish";
pub const REVIEW_DIR: &str = "data/review";

/// Minimum age of an archived file before it is published.
pub const WAITING_PERIOD: &str = "14d";

/// Changed versions of a delivered product allowed before escalation.
pub const MAX_SUPPLEMENTS: u32 = 2;

// ============================================================================
// Aspect
// ============================================================================

/// Samples per solver call.
pub const ASPECT_BATCH_SIZE: usize = 1_000;

// ============================================================================
// Logging
// ============================================================================

pub const LOG_LEVEL: &str = "info";
pub const LOG_FORMAT: &str = "pretty";
