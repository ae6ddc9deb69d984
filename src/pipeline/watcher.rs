//! Raw telemetry directory watcher.
//!
//! Polls the telemetry directory, waits until a new file has stopped
//! growing, then puts it on a bounded queue. A queued file that is later
//! rewritten (new size or mtime) settles again and is queued again. A single consumer drains the
//! queue and ingests one file at a time on the blocking pool, so a failing
//! file never takes its siblings down with it.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Polling behaviour of the watcher.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub pattern: Regex,
    pub poll_interval: Duration,
    /// A file must keep the same size and mtime this long before it is queued
    pub settle: Duration,
    /// Queue files already present at startup
    pub start_with_unprocessed: bool,
}

/// Handles one queued file, returning the number of outputs written.
pub type FileHandler = Arc<dyn Fn(&Path) -> anyhow::Result<usize> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub handled: usize,
    pub failed: usize,
    pub outputs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observation {
    mtime: Option<SystemTime>,
    len: u64,
}

/// Run the watcher loop until cancelled or the queue closes.
pub async fn run_watcher(dir: PathBuf, settings: WatchSettings, tx: mpsc::Sender<PathBuf>, cancel: CancellationToken) {
    tracing::info!(
        dir = %dir.display(),
        pattern = %settings.pattern,
        "Telemetry watcher started"
    );

    // Queued files and what they looked like when queued.
    let mut enqueued: HashMap<PathBuf, Option<Observation>> = HashMap::new();
    let mut pending: HashMap<PathBuf, (Observation, Instant)> = HashMap::new();

    let existing = list_matching(&dir, &settings.pattern);
    if settings.start_with_unprocessed {
        tracing::info!(files = existing.len(), "Queueing files present at startup");
        for path in existing {
            if tx.send(path.clone()).await.is_err() {
                return;
            }
            let seen = observe(&path);
            enqueued.insert(path, seen);
        }
    } else {
        enqueued.extend(existing.into_iter().map(|path| {
            let seen = observe(&path);
            (path, seen)
        }));
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("Telemetry watcher stopping");
                return;
            }
            () = tokio::time::sleep(settings.poll_interval) => {}
        }

        let now = Instant::now();
        let listed = list_matching(&dir, &settings.pattern);
        enqueued.retain(|path, _| listed.contains(path));
        for path in listed {
            let current = observe(&path);
            if let Some(queued_as) = enqueued.get(&path) {
                if *queued_as == current {
                    continue;
                }
                tracing::debug!(file = %path.display(), "Queued file changed, waiting for it to settle");
                enqueued.remove(&path);
            }
            let Some(current) = current else {
                pending.remove(&path);
                continue;
            };
            match pending.get(&path) {
                Some((previous, since)) if *previous == current => {
                    if now.duration_since(*since) < settings.settle {
                        continue;
                    }
                }
                _ => {
                    pending.insert(path, (current, now));
                    continue;
                }
            }

            pending.remove(&path);
            tracing::debug!(file = %path.display(), "Queueing settled file");
            if tx.send(path.clone()).await.is_err() {
                tracing::debug!("Ingest queue closed, watcher stopping");
                return;
            }
            enqueued.insert(path, Some(current));
        }
    }
}

/// Drain the queue, handling one file at a time.
///
/// Returns when the queue closes, on cancellation, or after the first
/// failure when `stop_on_error` is set.
pub async fn run_consumer(
    mut rx: mpsc::Receiver<PathBuf>,
    handler: FileHandler,
    stop_on_error: bool,
    cancel: CancellationToken,
) -> ConsumerStats {
    let mut stats = ConsumerStats::default();
    loop {
        let path = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(path) => path,
                None => break,
            },
        };

        let job = Arc::clone(&handler);
        let file = path.clone();
        let outcome = tokio::task::spawn_blocking(move || job(&file)).await;
        stats.handled += 1;
        match outcome {
            Ok(Ok(outputs)) => {
                stats.outputs += outputs;
                tracing::info!(file = %path.display(), outputs, "Ingested file");
            }
            Ok(Err(e)) => {
                stats.failed += 1;
                tracing::error!(file = %path.display(), error = %e, "Ingest failed");
                if stop_on_error {
                    break;
                }
            }
            Err(e) => {
                stats.failed += 1;
                tracing::error!(file = %path.display(), error = %e, "Ingest task panicked");
                if stop_on_error {
                    break;
                }
            }
        }
    }
    tracing::info!(
        handled = stats.handled,
        failed = stats.failed,
        outputs = stats.outputs,
        "Ingest consumer stopped"
    );
    stats
}

fn list_matching(dir: &Path, pattern: &Regex) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cannot list telemetry directory");
            return Vec::new();
        }
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| pattern.is_match(n))
        })
        .collect();
    paths.sort();
    paths
}

fn observe(path: &Path) -> Option<Observation> {
    let meta = std::fs::metadata(path).ok()?;
    Some(Observation {
        mtime: meta.modified().ok(),
        len: meta.len(),
    })
}
