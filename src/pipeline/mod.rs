//! Processing Pipeline Module
//!
//! ```text
//! raw TM files ──> TelemetryIngestStep ──> LB archive ──> LevelUpStep ──> L0/L1/L2 archive
//!        ▲                    │                                │
//!        │                    └──────── PipelineOrchestrator ──┘
//!   ingest watcher            (ledger check, worker pool, single ledger writer)
//! ```

mod orchestrator;
mod step;
mod steps;
pub mod watcher;

pub use orchestrator::{OrchestratorError, OrchestratorSettings, PipelineOrchestrator, RunSummary};
pub use step::{ProcessingStep, StepError};
pub use steps::{AspectStep, LevelUpStep, ProductTransform, TelemetryIngestStep};
pub use watcher::{run_consumer, run_watcher, ConsumerStats, FileHandler, WatchSettings};
