//! Aspect solution driver
//!
//! The aspect solver is an external computation that turns a batch of
//! aspect samples into per-sample pointing offsets. It is called in batches;
//! a failing batch leaves its samples without a solution and the remaining
//! batches still run.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Input sample for the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectSample {
    /// SCET seconds
    pub time: f64,
    /// Raw photodiode readings
    pub signals: [f64; 4],
}

/// Pointing offset for one sample, in arcseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AspectOffset {
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, thiserror::Error)]
#[error("aspect solver failed: {0}")]
pub struct SolverError(pub String);

/// Failable, batchable call contract of the external solver.
pub trait AspectSolver: Send + Sync {
    /// Must return one offset per input sample.
    fn solve(&self, batch: &[AspectSample]) -> Result<Vec<AspectOffset>, SolverError>;
}

/// Per-sample results plus the batches that failed.
#[derive(Debug, Default)]
pub struct AspectSolution {
    pub offsets: Vec<Option<AspectOffset>>,
    /// `(first_sample_index, error)` of each failed batch
    pub failed_batches: Vec<(usize, SolverError)>,
}

impl AspectSolution {
    pub fn solved(&self) -> usize {
        self.offsets.iter().filter(|o| o.is_some()).count()
    }
}

/// Run `solver` over `samples` in batches of at most `batch_size`.
pub fn solve_in_batches(solver: &dyn AspectSolver, samples: &[AspectSample], batch_size: usize) -> AspectSolution {
    let batch_size = batch_size.max(1);
    let mut solution = AspectSolution {
        offsets: Vec::with_capacity(samples.len()),
        failed_batches: Vec::new(),
    };

    for (batch_no, batch) in samples.chunks(batch_size).enumerate() {
        let start = batch_no * batch_size;
        match solver.solve(batch) {
            Ok(offsets) if offsets.len() == batch.len() => {
                solution.offsets.extend(offsets.into_iter().map(Some));
            }
            Ok(offsets) => {
                let err = SolverError(format!(
                    "returned {} offsets for {} samples",
                    offsets.len(),
                    batch.len()
                ));
                warn!(start, samples = batch.len(), error = %err, "Aspect batch rejected");
                solution.offsets.extend(std::iter::repeat(None).take(batch.len()));
                solution.failed_batches.push((start, err));
            }
            Err(err) => {
                warn!(start, samples = batch.len(), error = %err, "Aspect batch failed");
                solution.offsets.extend(std::iter::repeat(None).take(batch.len()));
                solution.failed_batches.push((start, err));
            }
        }
    }

    info!(
        samples = samples.len(),
        solved = solution.solved(),
        failed_batches = solution.failed_batches.len(),
        "Aspect solution finished"
    );
    solution
}
