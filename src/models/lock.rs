//! Per-file fetch locking
//!
//! Two layers: an async mutex per cache path serializes tasks in this
//! process, and an advisory `flock` on a sibling `.lock` file serializes
//! separate processes sharing the same root directory.

use super::run_blocking;
use crate::error::{StoreError, StoreResult};
use dashmap::DashMap;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of in-process locks keyed by cache file path
#[derive(Debug, Default)]
pub struct FetchLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

/// Held while a cache file is being fetched; releases both layers on drop
#[derive(Debug)]
pub struct FetchGuard {
    // Dropped first: closing the descriptor releases the flock
    _file: Option<File>,
    _local: OwnedMutexGuard<()>,
    contended: bool,
}

impl FetchGuard {
    /// Whether another holder had the lock when we asked for it
    pub fn was_contended(&self) -> bool {
        self.contended
    }
}

impl FetchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `file_path`, optionally also taking `lock_path` exclusively
    pub async fn acquire(
        &self,
        file_path: &Path,
        lock_path: Option<PathBuf>,
    ) -> StoreResult<FetchGuard> {
        let mutex = self
            .locks
            .entry(file_path.to_path_buf())
            .or_default()
            .clone();
        let (local, mut contended) = match mutex.clone().try_lock_owned() {
            Ok(guard) => (guard, false),
            Err(_) => (mutex.lock_owned().await, true),
        };

        let file = match lock_path {
            Some(path) => {
                let (file, waited) = run_blocking(move || lock_exclusive(&path)).await?;
                contended |= waited;
                Some(file)
            }
            None => None,
        };

        Ok(FetchGuard {
            _file: file,
            _local: local,
            contended,
        })
    }
}

fn lock_exclusive(path: &Path) -> StoreResult<(File, bool)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;

    let mut waited = false;
    if let Err(e) = file.try_lock_exclusive() {
        if e.kind() != std::io::ErrorKind::WouldBlock {
            return Err(StoreError::io(path, e));
        }
        tracing::info!(lock = ?path, "Waiting for another process to finish fetching");
        file.lock_exclusive().map_err(|e| StoreError::io(path, e))?;
        waited = true;
    }

    tracing::debug!(lock = ?path, "Acquired fetch lock");
    Ok((file, waited))
}
