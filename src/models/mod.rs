//! Pretrained model storage
//!
//! Provides functionality for:
//! - Looking up expected content hashes of model zoo entries
//! - Resolving a model name to a verified local parameter file
//! - Downloading and unpacking model archives from the repository
//! - Purging cached parameter files

pub mod archive;
pub mod cache;
pub mod download;
pub mod lock;
pub mod registry;
pub mod verify;

pub use archive::{Archiver, ZipArchiver};
pub use cache::{CacheStatus, CachedModel, ModelCache, ModelCacheBuilder, get_model_file, purge};
pub use download::{Downloader, HttpDownloader};
pub use lock::{FetchGuard, FetchLocks};
pub use registry::{ModelRegistry, SHORT_HASH_LEN};
pub use verify::{HashVerifier, Sha1Verifier};

use crate::error::{StoreError, StoreResult};

/// Run blocking filesystem work off the async executor.
///
/// A panic in `f` is resumed on the calling task rather than turned into an error.
pub(crate) async fn run_blocking<T, F>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(StoreError::Cancelled),
    }
}
