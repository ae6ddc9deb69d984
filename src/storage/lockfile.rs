//! Ledger Writer Lock
//!
//! The ledgers assume a single writer process. A PID file in the ledger
//! directory keeps a second pipeline process from opening them while the
//! first is still running.

use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// PID lock over a ledger directory, released on drop.
#[derive(Debug)]
pub struct ProcessLock {
    lock_path: PathBuf,
    owned: bool,
}

impl ProcessLock {
    const LOCK_FILE_NAME: &'static str = ".stix-pipeline.lock";

    /// Acquire the lock for `ledger_dir`, creating the directory if needed.
    ///
    /// Fails if a live pipeline process holds it. A lock left by a process
    /// that no longer exists is taken over.
    pub fn acquire<P: AsRef<Path>>(ledger_dir: P) -> Result<Self> {
        let ledger_dir = ledger_dir.as_ref();
        fs::create_dir_all(ledger_dir)
            .with_context(|| format!("Failed to create ledger directory {}", ledger_dir.display()))?;

        let lock_path = ledger_dir.join(Self::LOCK_FILE_NAME);
        if lock_path.exists() {
            match read_pid(&lock_path) {
                Ok(pid) if pid == std::process::id() => {
                    bail!("Ledger at {} is already locked by this process", ledger_dir.display());
                }
                Ok(pid) if is_pipeline_process(pid) => {
                    bail!(
                        "Ledger at {} is in use by pipeline process {}; \
                         stop it or remove {} if it is gone",
                        ledger_dir.display(),
                        pid,
                        lock_path.display()
                    );
                }
                Ok(pid) => {
                    tracing::info!(pid, "Taking over stale ledger lock");
                    fs::remove_file(&lock_path).context("Failed to remove stale lock file")?;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable ledger lock, replacing it");
                    fs::remove_file(&lock_path).context("Failed to remove unreadable lock file")?;
                }
            }
        }

        let pid = std::process::id();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file {}", lock_path.display()))?;
        writeln!(file, "{}", pid).context("Failed to write PID to lock file")?;

        tracing::debug!(pid, path = %lock_path.display(), "Acquired ledger lock");
        Ok(Self {
            lock_path,
            owned: true,
        })
    }

    /// Release the lock (called automatically on drop)
    pub fn release(&mut self) {
        if !self.owned {
            return;
        }
        match fs::remove_file(&self.lock_path) {
            Ok(()) => tracing::debug!(path = %self.lock_path.display(), "Released ledger lock"),
            Err(e) => tracing::warn!(error = %e, "Failed to remove lock file"),
        }
        self.owned = false;
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(lock_path: &Path) -> Result<u32> {
    let contents = fs::read_to_string(lock_path).context("Failed to read lock file")?;
    contents
        .trim()
        .parse()
        .context("Failed to parse PID from lock file")
}

#[cfg(unix)]
fn is_pipeline_process(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{}/cmdline", pid))
        .map(|cmdline| cmdline.contains("stix"))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_pipeline_process(_pid: u32) -> bool {
    true
}
