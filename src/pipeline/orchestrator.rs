//! Pipeline Orchestrator
//!
//! Runs one processing step over a set of input files:
//!
//! ```text
//! inputs ──> ledger check ──> batches by key ──> worker pool ──> ledger writes
//!            (skip done)      (sub-batched)      (read-only)     (parent only)
//! ```
//!
//! Workers only read. All ledger writes happen on the calling thread after
//! every batch has returned, so the ledger has exactly one writer. Failed
//! inputs, including ones that cannot be stat'ed, leave no record and are
//! retried on the next run.

use super::step::{ProcessingStep, StepError};
use crate::storage::{LedgerIdentity, ProcessedRecord, ProcessingHistoryLedger, StorageError};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("processing ledger: {0}")]
    Storage(#[from] StorageError),

    #[error("cannot stat input {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("stopped on error processing {input}: {source}")]
    StoppedOnError {
        input: PathBuf,
        #[source]
        source: StepError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub stop_on_error: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 50,
            stop_on_error: false,
        }
    }
}

/// Statistics of one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub candidates: usize,
    /// Already processed according to the ledger
    pub skipped: usize,
    /// Inputs not handled by the step
    pub ignored: usize,
    pub batches: usize,
    pub processed: usize,
    pub outputs: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub ledger_rows: usize,
}

struct WorkItem {
    input: PathBuf,
    identity: LedgerIdentity,
}

struct WorkResult {
    input: PathBuf,
    identity: LedgerIdentity,
    outcome: Result<Vec<PathBuf>, StepError>,
    finished_at: DateTime<Utc>,
}

pub struct PipelineOrchestrator {
    ledger: ProcessingHistoryLedger,
    pool: rayon::ThreadPool,
    settings: OrchestratorSettings,
}

impl PipelineOrchestrator {
    pub fn new(ledger: ProcessingHistoryLedger, settings: OrchestratorSettings) -> Result<Self, OrchestratorError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.workers.max(1))
            .thread_name(|i| format!("pipeline-worker-{}", i))
            .build()?;
        Ok(Self { ledger, pool, settings })
    }

    pub fn ledger(&self) -> &ProcessingHistoryLedger {
        &self.ledger
    }

    /// Process every input not yet recorded in the ledger.
    pub fn run(&self, step: &dyn ProcessingStep, inputs: &[PathBuf]) -> Result<RunSummary, OrchestratorError> {
        let mut summary = RunSummary {
            candidates: inputs.len(),
            ..RunSummary::default()
        };

        let mut batches: BTreeMap<String, Vec<WorkItem>> = BTreeMap::new();
        for input in inputs {
            let Some(identity) = step.identity(input) else {
                debug!(step = step.step_name(), file = %input.display(), "Input not handled by step");
                summary.ignored += 1;
                continue;
            };
            let modified = match modified_time(input) {
                Ok(modified) => modified,
                Err(e) if self.settings.stop_on_error => return Err(e),
                Err(e) => {
                    error!(step = step.step_name(), file = %input.display(), error = %e, "Cannot check input");
                    summary.failed.push((input.clone(), e.to_string()));
                    continue;
                }
            };
            if self.ledger.has_processed(&identity, input, modified)? {
                summary.skipped += 1;
                continue;
            }
            batches.entry(step.batch_key(input)).or_default().push(WorkItem {
                input: input.clone(),
                identity,
            });
        }

        let batch_size = self.settings.batch_size.max(1);
        let work: Vec<&[WorkItem]> = batches
            .iter()
            .flat_map(|(key, items)| {
                if step.splittable(key) {
                    items.chunks(batch_size).collect::<Vec<_>>()
                } else {
                    vec![items.as_slice()]
                }
            })
            .collect();
        summary.batches = work.len();
        info!(
            step = step.step_name(),
            candidates = summary.candidates,
            skipped = summary.skipped,
            batches = summary.batches,
            "Starting processing run"
        );

        let abort = AtomicBool::new(false);
        let stop_on_error = self.settings.stop_on_error;
        let results: Vec<WorkResult> = self.pool.install(|| {
            work.par_iter()
                .flat_map_iter(|batch| run_batch(step, batch, stop_on_error, &abort))
                .collect()
        });

        // Single writer: record every success, then report failures.
        let mut first_failure: Option<(PathBuf, StepError)> = None;
        for result in results {
            match result.outcome {
                Ok(outputs) => {
                    summary.processed += 1;
                    summary.ledger_rows += self.record(&result.identity, &result.input, &outputs, result.finished_at)?;
                    summary.outputs.extend(outputs);
                }
                Err(e) => {
                    error!(step = step.step_name(), file = %result.input.display(), error = %e, "Processing failed");
                    summary.failed.push((result.input.clone(), e.to_string()));
                    if first_failure.is_none() {
                        first_failure = Some((result.input, e));
                    }
                }
            }
        }
        self.ledger.flush()?;

        info!(
            step = step.step_name(),
            processed = summary.processed,
            failed = summary.failed.len(),
            outputs = summary.outputs.len(),
            ledger_rows = summary.ledger_rows,
            "Processing run finished"
        );

        match first_failure {
            Some((input, source)) if stop_on_error => Err(OrchestratorError::StoppedOnError { input, source }),
            _ => Ok(summary),
        }
    }

    fn record(
        &self,
        identity: &LedgerIdentity,
        input: &Path,
        outputs: &[PathBuf],
        processed_at: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let mut record = ProcessedRecord {
            identity: identity.clone(),
            input_path: input.to_path_buf(),
            output_path: None,
            processed_at,
        };
        if outputs.is_empty() {
            return Ok(usize::from(self.ledger.add_processed(&record)?));
        }
        let mut rows = 0;
        for output in outputs {
            record.output_path = Some(output.clone());
            rows += usize::from(self.ledger.add_processed(&record)?);
        }
        Ok(rows)
    }
}

/// Run one batch sequentially on a worker.
fn run_batch(step: &dyn ProcessingStep, batch: &[WorkItem], stop_on_error: bool, abort: &AtomicBool) -> Vec<WorkResult> {
    let mut results = Vec::with_capacity(batch.len());
    for item in batch {
        if stop_on_error && abort.load(Ordering::Relaxed) {
            warn!(file = %item.input.display(), "Skipping input after earlier error");
            break;
        }
        let outcome = step.process(&item.input);
        if outcome.is_err() {
            abort.store(true, Ordering::Relaxed);
        }
        results.push(WorkResult {
            input: item.input.clone(),
            identity: item.identity.clone(),
            outcome,
            finished_at: Utc::now(),
        });
    }
    results
}

fn modified_time(path: &Path) -> Result<DateTime<Utc>, OrchestratorError> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .map_err(|e| OrchestratorError::Io(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProductLevel;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Copies `*.in` to `*.out`; fails on files containing "bad".
    struct CopyStep {
        calls: Mutex<Vec<PathBuf>>,
    }

    impl ProcessingStep for CopyStep {
        fn step_name(&self) -> &str {
            "copy"
        }

        fn identity(&self, input: &Path) -> Option<LedgerIdentity> {
            (input.extension()? == "in").then(|| LedgerIdentity::new("copy", ProductLevel::L0, "test", 1))
        }

        fn batch_key(&self, input: &Path) -> String {
            input.file_stem().unwrap().to_string_lossy()[..1].to_string()
        }

        fn process(&self, input: &Path) -> Result<Vec<PathBuf>, StepError> {
            self.calls.lock().unwrap().push(input.to_path_buf());
            let text = std::fs::read_to_string(input).unwrap();
            if text.contains("bad") {
                return Err(StepError::Collaborator {
                    collaborator: "copy",
                    input: input.to_path_buf(),
                    message: "bad input".to_string(),
                });
            }
            let out = input.with_extension("out");
            std::fs::write(&out, text).unwrap();
            Ok(vec![out])
        }
    }

    fn step() -> CopyStep {
        CopyStep {
            calls: Mutex::new(Vec::new()),
        }
    }

    fn setup(files: &[(&str, &str)]) -> (tempfile::TempDir, Vec<PathBuf>, ProcessingHistoryLedger) {
        let dir = tempdir().unwrap();
        let inputs = files
            .iter()
            .map(|(name, body)| {
                let path = dir.path().join(name);
                std::fs::write(&path, body).unwrap();
                path
            })
            .collect();
        let ledger = ProcessingHistoryLedger::open(dir.path().join("ledger")).unwrap();
        (dir, inputs, ledger)
    }

    #[test]
    fn test_rerun_is_noop() {
        let (_dir, inputs, ledger) = setup(&[("a1.in", "x"), ("a2.in", "y"), ("b1.in", "z"), ("notes.txt", "")]);
        let orchestrator = PipelineOrchestrator::new(ledger, OrchestratorSettings::default()).unwrap();
        let step = step();

        let first = orchestrator.run(&step, &inputs).unwrap();
        assert_eq!(first.processed, 3);
        assert_eq!(first.ignored, 1);
        assert_eq!(first.ledger_rows, 3);
        assert_eq!(first.batches, 2);

        let second = orchestrator.run(&step, &inputs).unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(second.ledger_rows, 0);
        assert_eq!(step.calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_failure_not_recorded_and_retried() {
        let (_dir, inputs, ledger) = setup(&[("a1.in", "ok"), ("a2.in", "bad")]);
        let orchestrator = PipelineOrchestrator::new(ledger, OrchestratorSettings::default()).unwrap();
        let step = step();

        let first = orchestrator.run(&step, &inputs).unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(first.failed.len(), 1);
        assert_eq!(orchestrator.ledger().count(), 1);

        let second = orchestrator.run(&step, &inputs).unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.failed.len(), 1);
    }

    #[test]
    fn test_stop_on_error_still_records_successes() {
        let (_dir, inputs, ledger) = setup(&[("a1.in", "ok"), ("b1.in", "bad")]);
        let settings = OrchestratorSettings {
            stop_on_error: true,
            workers: 1,
            ..OrchestratorSettings::default()
        };
        let orchestrator = PipelineOrchestrator::new(ledger, settings).unwrap();
        let result = orchestrator.run(&step(), &inputs);
        assert!(matches!(result, Err(OrchestratorError::StoppedOnError { .. })));
        assert_eq!(orchestrator.ledger().count(), 1);
    }

    #[test]
    fn test_sub_batching() {
        let files: Vec<(String, &str)> = (0..7).map(|i| (format!("a{}.in", i), "x")).collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(n, b)| (n.as_str(), *b)).collect();
        let (_dir, inputs, ledger) = setup(&refs);
        let settings = OrchestratorSettings {
            batch_size: 3,
            ..OrchestratorSettings::default()
        };
        let orchestrator = PipelineOrchestrator::new(ledger, settings).unwrap();
        let summary = orchestrator.run(&step(), &inputs).unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.processed, 7);
    }

    #[test]
    fn test_missing_input_reported_not_fatal() {
        let (dir, mut inputs, ledger) = setup(&[("a1.in", "x"), ("b1.in", "y")]);
        let vanished = dir.path().join("a2.in");
        inputs.push(vanished.clone());
        let orchestrator = PipelineOrchestrator::new(ledger, OrchestratorSettings::default()).unwrap();

        let summary = orchestrator.run(&step(), &inputs).unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, vanished);
        assert_eq!(orchestrator.ledger().count(), 2);
    }

    #[test]
    fn test_missing_input_stops_when_asked() {
        let (dir, mut inputs, ledger) = setup(&[("a1.in", "x")]);
        inputs.insert(0, dir.path().join("a0.in"));
        let settings = OrchestratorSettings {
            stop_on_error: true,
            ..OrchestratorSettings::default()
        };
        let orchestrator = PipelineOrchestrator::new(ledger, settings).unwrap();
        let step = step();

        assert!(matches!(orchestrator.run(&step, &inputs), Err(OrchestratorError::Io(..))));
        assert!(step.calls.lock().unwrap().is_empty());
        assert_eq!(orchestrator.ledger().count(), 0);
    }
}
