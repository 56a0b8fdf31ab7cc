//! Model cache integration tests
//!
//! Serves model archives from a local axum server so the full
//! download → extract → verify path runs against real HTTP.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use gluon_model_store::{
    CacheStatus, ModelCache, ModelRegistry, StoreError, get_model_file, purge,
};
use serial_test::serial;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const MODEL: &str = "tinynet";
const WEIGHTS: &[u8] = b"tinynet parameters v1";

fn sha1_hex(data: &[u8]) -> String {
    format!("{:x}", Sha1::digest(data))
}

fn registry() -> ModelRegistry {
    ModelRegistry::from_entries([(MODEL, sha1_hex(WEIGHTS))])
}

fn file_stem() -> String {
    format!("{}-{}", MODEL, &sha1_hex(WEIGHTS)[..8])
}

fn archive_path() -> String {
    format!("/gluon/models/{}.zip", file_stem())
}

fn zip_bytes(entry: &str, data: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    writer.start_file(entry, options).unwrap();
    writer.write_all(data).unwrap();
    writer.finish().unwrap().into_inner()
}

// ============================================================================
// Fixture repository
// ============================================================================

#[derive(Clone, Default)]
struct Repo {
    archives: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    requests: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl Repo {
    fn with_archive(self, path: &str, body: Vec<u8>) -> Self {
        self.archives.lock().unwrap().insert(path.to_string(), body);
        self
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_archive(State(repo): State<Repo>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    repo.requests.lock().unwrap().push(path.clone());
    if !repo.delay.is_zero() {
        tokio::time::sleep(repo.delay).await;
    }

    let body = repo.archives.lock().unwrap().get(&path).cloned();
    match body {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Start the fixture server, returning its base URL (no trailing slash)
async fn start_repo(repo: Repo) -> String {
    let app = Router::new().fallback(serve_archive).with_state(repo);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn cache(root: &Path, repo_url: &str) -> ModelCache {
    ModelCache::builder()
        .root_dir(root)
        .repo_url(repo_url)
        .registry(registry())
        .download_retries(0)
        .download_timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build cache")
}

// ============================================================================
// Resolve
// ============================================================================

#[tokio::test]
async fn test_fetch_into_missing_root() {
    let repo = Repo::default().with_archive(
        &archive_path(),
        zip_bytes(&format!("{}.params", file_stem()), WEIGHTS),
    );
    let base = start_repo(repo.clone()).await;

    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("nested/models");
    let path = cache(&root, &base).resolve(MODEL).await.unwrap();

    assert_eq!(path, root.join(format!("{}.params", file_stem())));
    assert_eq!(std::fs::read(&path).unwrap(), WEIGHTS);
    assert!(!root.join(format!("{}.zip", file_stem())).exists());
    assert_eq!(repo.requests(), vec![archive_path()]);
}

#[tokio::test]
async fn test_cache_hit_makes_no_request() {
    let repo = Repo::default();
    let base = start_repo(repo.clone()).await;

    let temp_dir = TempDir::new().unwrap();
    let expected = temp_dir.path().join(format!("{}.params", file_stem()));
    std::fs::write(&expected, WEIGHTS).unwrap();

    let path = cache(temp_dir.path(), &base).resolve(MODEL).await.unwrap();
    assert_eq!(path, expected);
    assert!(repo.requests().is_empty());
}

#[tokio::test]
async fn test_mismatch_triggers_single_refetch() {
    let repo = Repo::default().with_archive(&archive_path(), zip_bytes("w.params", WEIGHTS));
    let base = start_repo(repo.clone()).await;

    let temp_dir = TempDir::new().unwrap();
    let stale = temp_dir.path().join(format!("{}.params", file_stem()));
    std::fs::write(&stale, b"truncated").unwrap();

    let cache = cache(temp_dir.path(), &base);
    assert_eq!(cache.status(MODEL).await.unwrap(), CacheStatus::Mismatch);

    let path = cache.resolve(MODEL).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), WEIGHTS);
    assert_eq!(repo.requests().len(), 1);
    assert_eq!(cache.status(MODEL).await.unwrap(), CacheStatus::Valid);
}

#[tokio::test]
async fn test_bad_download_is_integrity_error() {
    let repo =
        Repo::default().with_archive(&archive_path(), zip_bytes("w.params", b"tampered weights"));
    let base = start_repo(repo.clone()).await;

    let temp_dir = TempDir::new().unwrap();
    std::fs::write(
        temp_dir.path().join(format!("{}.params", file_stem())),
        b"stale",
    )
    .unwrap();

    let err = cache(temp_dir.path(), &base)
        .resolve(MODEL)
        .await
        .unwrap_err();
    match err {
        StoreError::Integrity { path, name } => {
            assert_eq!(name, MODEL);
            assert!(path.ends_with(format!("{}.params", file_stem())));
        }
        other => panic!("expected integrity error, got {:?}", other),
    }
    // One re-fetch only, never retried after the downloaded copy fails
    assert_eq!(repo.requests().len(), 1);
    assert!(!temp_dir.path().join(format!("{}.zip", file_stem())).exists());
}

#[tokio::test]
async fn test_missing_archive_is_download_error() {
    let repo = Repo::default();
    let base = start_repo(repo.clone()).await;

    let temp_dir = TempDir::new().unwrap();
    let err = cache(temp_dir.path(), &base)
        .resolve(MODEL)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Download { .. }));
    assert!(!temp_dir.path().join(format!("{}.params", file_stem())).exists());
    assert!(!temp_dir.path().join(format!("{}.zip", file_stem())).exists());
}

#[tokio::test]
async fn test_unknown_model_fails_before_io() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("models");

    let err = get_model_file("resnet9000_v9", &root).await.unwrap_err();
    assert!(matches!(err, StoreError::UnknownModel { ref name } if name == "resnet9000_v9"));
    assert!(!root.exists());
}

#[tokio::test]
async fn test_concurrent_resolves_download_once() {
    let repo = Repo {
        delay: Duration::from_millis(200),
        ..Default::default()
    }
    .with_archive(&archive_path(), zip_bytes("w.params", WEIGHTS));
    let base = start_repo(repo.clone()).await;

    let temp_dir = TempDir::new().unwrap();
    let cache = Arc::new(cache(temp_dir.path(), &base));

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.resolve(MODEL).await })
        })
        .collect();

    for task in tasks {
        let path = task.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), WEIGHTS);
    }
    assert_eq!(repo.requests().len(), 1);
}

// ============================================================================
// Repository URL override
// ============================================================================

#[tokio::test]
#[serial]
async fn test_env_override_sets_base_url() {
    let repo = Repo::default().with_archive(&archive_path(), zip_bytes("w.params", WEIGHTS));
    let base = start_repo(repo.clone()).await;

    for override_url in [base.clone(), format!("{}/", base)] {
        let temp_dir = TempDir::new().unwrap();
        unsafe {
            std::env::set_var("MXNET_GLUON_REPO", &override_url);
        }

        let cache = ModelCache::builder()
            .root_dir(temp_dir.path())
            .registry(registry())
            .download_retries(0)
            .build()
            .unwrap();
        assert_eq!(
            cache.archive_url(MODEL).unwrap(),
            format!("{}{}", base, archive_path())
        );
        let result = cache.resolve(MODEL).await;

        unsafe {
            std::env::remove_var("MXNET_GLUON_REPO");
        }
        result.unwrap();
    }

    assert_eq!(repo.requests(), vec![archive_path(), archive_path()]);
}

// ============================================================================
// Purge
// ============================================================================

#[tokio::test]
async fn test_purge_removes_only_params_files() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    for name in ["a-11111111.params", "b-22222222.params", "c-33333333.params"] {
        std::fs::write(root.join(name), b"w").unwrap();
    }
    for name in ["notes.txt", "a-11111111.lock", "archive.zip"] {
        std::fs::write(root.join(name), b"keep").unwrap();
    }

    let removed = purge(root).await.unwrap();
    assert_eq!(removed, 3);

    let mut remaining: Vec<String> = std::fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    remaining.sort();
    assert_eq!(remaining, vec!["a-11111111.lock", "archive.zip", "notes.txt"]);

    // Idempotent on an already empty cache
    assert_eq!(purge(root).await.unwrap(), 0);
}

#[tokio::test]
async fn test_purge_nonexistent_directory() {
    let temp_dir = TempDir::new().unwrap();
    assert_eq!(purge(temp_dir.path().join("missing")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_purge_then_resolve_refetches() {
    let repo = Repo::default().with_archive(&archive_path(), zip_bytes("w.params", WEIGHTS));
    let base = start_repo(repo.clone()).await;

    let temp_dir = TempDir::new().unwrap();
    let cache = cache(temp_dir.path(), &base);

    cache.resolve(MODEL).await.unwrap();
    assert_eq!(cache.purge().await.unwrap(), 1);
    assert_eq!(cache.status(MODEL).await.unwrap(), CacheStatus::Missing);

    cache.resolve(MODEL).await.unwrap();
    assert_eq!(repo.requests().len(), 2);
}
