//! stix-pipeline: spacecraft telemetry ground-segment pipeline
//!
//! ## Architecture
//!
//! - **Acquisition**: raw telemetry files to packets, packets to sequences
//! - **Products**: kind dispatch, decoding, merge-on-append and the archive
//! - **Storage**: processing and publish ledgers in one sled database
//! - **Pipeline**: processing steps, the orchestrator and the ingest watcher
//! - **Publish**: candidate discovery and conflict resolution for delivery

pub mod acquisition;
pub mod config;
pub mod pipeline;
pub mod products;
pub mod publish;
pub mod storage;
pub mod types;

pub use config::PipelineConfig;
pub use pipeline::{PipelineOrchestrator, ProcessingStep};
pub use products::{ProductArchive, ProductKind, ProductMerger};
pub use publish::PublishConflictResolver;
pub use storage::{Ledgers, ProcessingHistoryLedger, PublishHistoryStorage, StorageError};
pub use types::{SCETime, SCETimeDelta, SCETimeRange};
