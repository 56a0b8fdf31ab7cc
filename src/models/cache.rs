//! Verified local cache of model parameter files
//!
//! Cache layout:
//! ```text
//! ~/.mxnet/models/
//! ├── resnet18_v1-a0666292.params   # verified parameters
//! ├── resnet18_v1-a0666292.lock     # fetch lock, kept between runs
//! └── resnet18_v1-a0666292.zip      # only present while fetching
//! ```
//!
//! The hash prefix in the file name keeps distinct model versions apart on
//! disk. Integrity comes from comparing the full content hash before a path
//! is handed out.

use super::archive::{Archiver, ZipArchiver};
use super::download::{Downloader, HttpDownloader};
use super::lock::FetchLocks;
use super::registry::ModelRegistry;
use super::verify::{HashVerifier, Sha1Verifier};
use crate::config::{StoreConfig, expand_tilde, normalize_repo_url, repo_url_from_env};
use crate::error::{StoreError, StoreResult};
use crate::metrics;
use serde::Serialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const PARAMS_EXTENSION: &str = "params";
const PARAMS_SUFFIX: &str = ".params";

/// Path under the repository base URL holding model archives
const MODELS_URL_PATH: &str = "gluon/models/";

// Shared by every cache in the process so that separately built caches
// pointing at the same root still serialize their fetches.
static PROCESS_LOCKS: LazyLock<Arc<FetchLocks>> = LazyLock::new(|| Arc::new(FetchLocks::new()));

/// State of a model's cache file on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// No file at the expected path
    Missing,
    /// File present and its content hash matches the registry
    Valid,
    /// File present but its content hash differs
    Mismatch,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Valid => write!(f, "valid"),
            Self::Mismatch => write!(f, "mismatch"),
        }
    }
}

/// A parameter file found in the cache directory
#[derive(Debug, Clone, Serialize)]
pub struct CachedModel {
    pub path: PathBuf,
    /// Registered model the file name belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub size_bytes: u64,
}

/// Resolves model names to verified parameter files, fetching when needed
pub struct ModelCache {
    root_dir: PathBuf,
    repo_url: Option<String>,
    file_lock: bool,
    registry: ModelRegistry,
    downloader: Arc<dyn Downloader>,
    archiver: Arc<dyn Archiver>,
    verifier: Arc<dyn HashVerifier>,
    locks: Arc<FetchLocks>,
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("root_dir", &self.root_dir)
            .field("repo_url", &self.repo_url)
            .field("file_lock", &self.file_lock)
            .field("models", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ModelCache`]; unset parts fall back to the defaults
#[derive(Default)]
pub struct ModelCacheBuilder {
    root_dir: Option<PathBuf>,
    repo_url: Option<String>,
    file_lock: Option<bool>,
    download_retries: Option<u32>,
    download_timeout: Option<Duration>,
    registry: Option<ModelRegistry>,
    downloader: Option<Arc<dyn Downloader>>,
    archiver: Option<Arc<dyn Archiver>>,
    verifier: Option<Arc<dyn HashVerifier>>,
}

impl ModelCacheBuilder {
    /// Cache directory; a leading `~` is expanded when used
    pub fn root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root_dir.into());
        self
    }

    /// Fixed repository base URL. Without one, `MXNET_GLUON_REPO` is read on every fetch.
    pub fn repo_url(mut self, repo_url: impl Into<String>) -> Self {
        self.repo_url = Some(repo_url.into());
        self
    }

    pub fn file_lock(mut self, enabled: bool) -> Self {
        self.file_lock = Some(enabled);
        self
    }

    pub fn download_retries(mut self, retries: u32) -> Self {
        self.download_retries = Some(retries);
        self
    }

    /// Stall timeout for the default downloader, see [`HttpDownloader::new`]
    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = Some(timeout);
        self
    }

    pub fn registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn HashVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn build(self) -> StoreResult<ModelCache> {
        let defaults = StoreConfig::default();

        let downloader: Arc<dyn Downloader> = match self.downloader {
            Some(downloader) => downloader,
            None => Arc::new(HttpDownloader::new(
                self.download_timeout
                    .unwrap_or(Duration::from_secs(defaults.download_timeout_secs)),
                self.download_retries.unwrap_or(defaults.download_retries),
            )?),
        };

        Ok(ModelCache {
            root_dir: self.root_dir.unwrap_or(defaults.root_dir),
            repo_url: self.repo_url,
            file_lock: self.file_lock.unwrap_or(defaults.file_lock),
            registry: self
                .registry
                .unwrap_or_else(|| ModelRegistry::builtin().clone()),
            downloader,
            archiver: self.archiver.unwrap_or_else(|| Arc::new(ZipArchiver)),
            verifier: self.verifier.unwrap_or_else(|| Arc::new(Sha1Verifier)),
            locks: PROCESS_LOCKS.clone(),
        })
    }
}

impl ModelCache {
    pub fn builder() -> ModelCacheBuilder {
        ModelCacheBuilder::default()
    }

    /// Build a cache with the default collaborators from configuration
    pub fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        Self::builder()
            .root_dir(&config.root_dir)
            .repo_url(&config.repo_url)
            .file_lock(config.file_lock)
            .download_retries(config.download_retries)
            .download_timeout(Duration::from_secs(config.download_timeout_secs))
            .build()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Root directory with `~` expanded
    pub fn root_dir(&self) -> StoreResult<PathBuf> {
        expand_tilde(&self.root_dir)
    }

    /// First characters of the model's expected hash
    pub fn short_hash(&self, name: &str) -> StoreResult<String> {
        self.registry.short_hash(name).map(str::to_string)
    }

    /// Where the parameter file for `name` lives, whether or not it exists yet
    pub fn model_path(&self, name: &str) -> StoreResult<PathBuf> {
        let stem = self.registry.file_stem(name)?;
        Ok(self.root_dir()?.join(format!("{}{}", stem, PARAMS_SUFFIX)))
    }

    /// Base URL with exactly one trailing `/`
    pub fn repo_url(&self) -> String {
        let url = self.repo_url.clone().unwrap_or_else(repo_url_from_env);
        normalize_repo_url(&url)
    }

    /// URL of the archive holding the parameters for `name`
    pub fn archive_url(&self, name: &str) -> StoreResult<String> {
        let stem = self.registry.file_stem(name)?;
        Ok(format!("{}{}{}.zip", self.repo_url(), MODELS_URL_PATH, stem))
    }

    /// Check the cached file for `name` without fetching anything
    pub async fn status(&self, name: &str) -> StoreResult<CacheStatus> {
        let expected = self.registry.expected_hash(name)?;
        let file_path = self.model_path(name)?;
        self.check_file(&file_path, expected).await
    }

    async fn check_file(&self, file_path: &Path, expected: &str) -> StoreResult<CacheStatus> {
        let exists = tokio::fs::try_exists(file_path)
            .await
            .map_err(|e| StoreError::io(file_path, e))?;
        if !exists {
            return Ok(CacheStatus::Missing);
        }
        if self.verifier.verify(file_path, expected).await? {
            Ok(CacheStatus::Valid)
        } else {
            Ok(CacheStatus::Mismatch)
        }
    }

    /// Return the path of a verified parameter file for `name`.
    ///
    /// A cached file whose hash matches is returned without any network
    /// access. A missing or mismatching file is fetched once; if the fetched
    /// file does not verify either, [`StoreError::Integrity`] is returned.
    pub async fn resolve(&self, name: &str) -> StoreResult<PathBuf> {
        let expected = self.registry.expected_hash(name)?;
        let file_path = self.model_path(name)?;

        match self.check_file(&file_path, expected).await? {
            CacheStatus::Valid => {
                tracing::debug!(model = %name, path = ?file_path, "Cache hit");
                metrics::record_cache_hit(name);
                return Ok(file_path);
            }
            CacheStatus::Mismatch => {
                tracing::warn!(
                    model = %name,
                    path = ?file_path,
                    "Mismatch in the content of model file detected, refetching"
                );
                metrics::record_refetch(name);
            }
            CacheStatus::Missing => {
                tracing::warn!(
                    model = %name,
                    path = ?file_path,
                    "Model file not found, fetching"
                );
            }
        }

        self.fetch(name, &file_path, expected).await
    }

    async fn fetch(&self, name: &str, file_path: &Path, expected: &str) -> StoreResult<PathBuf> {
        let root = self.root_dir()?;
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(&root, e))?;

        let stem = self.registry.file_stem(name)?;
        let lock_path = self
            .file_lock
            .then(|| root.join(format!("{}.lock", stem)));
        let guard = self.locks.acquire(file_path, lock_path).await?;

        // Another process may have finished a fetch between our first check and
        // taking the lock, without us ever waiting on it
        if self.check_file(file_path, expected).await? == CacheStatus::Valid {
            tracing::info!(
                model = %name,
                path = ?file_path,
                contended = guard.was_contended(),
                "Model fetched by another caller"
            );
            return Ok(file_path.to_path_buf());
        }

        let url = self.archive_url(name)?;
        let zip_path = root.join(format!("{}.zip", stem));
        metrics::record_fetch(name);
        self.downloader.download(&url, &zip_path, true).await?;

        // The archive is removed once extraction has been attempted, even on failure
        let extracted = self.archiver.extract(&zip_path, file_path).await;
        if let Err(e) = tokio::fs::remove_file(&zip_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = ?zip_path, error = %e, "Failed to remove model archive");
        }
        extracted?;

        if self.verifier.verify(file_path, expected).await? {
            tracing::info!(model = %name, path = ?file_path, "Model fetched and verified");
            Ok(file_path.to_path_buf())
        } else {
            metrics::record_integrity_failure(name);
            Err(StoreError::Integrity {
                path: file_path.to_path_buf(),
                name: name.to_string(),
            })
        }
    }

    /// Delete every `*.params` file in the root directory, returning how many were removed
    pub async fn purge(&self) -> StoreResult<usize> {
        let root = self.root_dir()?;
        let files = list_params_files(&root).await?;

        let mut removed = 0;
        for path in files {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!(path = ?path, "Removed cached model");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }

        if removed > 0 {
            tracing::info!(root = ?root, removed, "Purged model cache");
        }
        metrics::record_purged(removed);
        Ok(removed)
    }

    /// Parameter files currently in the root directory, sorted by path
    pub async fn cached_models(&self) -> StoreResult<Vec<CachedModel>> {
        let root = self.root_dir()?;
        let mut models = Vec::new();

        for path in list_params_files(&root).await? {
            let size_bytes = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(&path, e)),
            };
            let model = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(PARAMS_SUFFIX))
                .and_then(|stem| self.registry.model_for_stem(stem))
                .map(str::to_string);
            models.push(CachedModel {
                path,
                model,
                size_bytes,
            });
        }

        Ok(models)
    }
}

/// `*.params` entries directly under `root`, matched the way a shell glob
/// would: hidden names are skipped, names need not be UTF-8, and symlinks are
/// listed unless they point at a directory. A missing directory yields nothing.
async fn list_params_files(root: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(root, e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(root, e))?
    {
        let path = entry.path();
        let file_name = entry.file_name();
        if file_name.as_encoded_bytes().first() == Some(&b'.')
            || path.extension() != Some(OsStr::new(PARAMS_EXTENSION))
        {
            continue;
        }

        let file_type = entry
            .file_type()
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() {
            match tokio::fs::metadata(&path).await {
                Ok(target) if target.is_dir() => continue,
                Ok(_) => {}
                // Dangling link: still a match, removing it is harmless
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        files.push(path);
    }

    files.sort();
    Ok(files)
}

/// Resolve `name` to a verified parameter file under `root` using the default stack
pub async fn get_model_file(name: &str, root: impl AsRef<Path>) -> StoreResult<PathBuf> {
    // Fail before building an HTTP client for names we cannot serve
    ModelRegistry::builtin().expected_hash(name)?;
    ModelCache::builder()
        .root_dir(root.as_ref())
        .build()?
        .resolve(name)
        .await
}

/// Delete every `*.params` file under `root`
pub async fn purge(root: impl AsRef<Path>) -> StoreResult<usize> {
    ModelCache::builder()
        .root_dir(root.as_ref())
        .downloader(Arc::new(NoopDownloader))
        .build()?
        .purge()
        .await
}

/// Stand-in for operations that never fetch
struct NoopDownloader;

#[async_trait::async_trait]
impl Downloader for NoopDownloader {
    async fn download(&self, url: &str, _destination: &Path, _overwrite: bool) -> StoreResult<()> {
        Err(StoreError::download(url, "downloads are disabled for this cache"))
    }
}
