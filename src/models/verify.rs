//! Content hashing for cached parameter files

use super::run_blocking;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Computes and checks content hashes of files on disk
#[async_trait]
pub trait HashVerifier: Send + Sync {
    /// Lowercase hex digest of the file at `path`
    async fn content_hash(&self, path: &Path) -> StoreResult<String>;

    /// Whether the file at `path` hashes to `expected` (hex, case-insensitive)
    async fn verify(&self, path: &Path, expected: &str) -> StoreResult<bool> {
        let actual = self.content_hash(path).await?;
        Ok(actual.eq_ignore_ascii_case(expected))
    }
}

/// SHA-1 verifier matching the digests published for the model zoo
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha1Verifier;

#[async_trait]
impl HashVerifier for Sha1Verifier {
    async fn content_hash(&self, path: &Path) -> StoreResult<String> {
        let path = path.to_path_buf();
        run_blocking(move || sha1_file(&path)).await
    }
}

/// Stream a file through SHA-1
pub fn sha1_file(path: &Path) -> StoreResult<String> {
    let mut file = std::fs::File::open(path).map_err(|e| StoreError::io(path, e))?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(|e| StoreError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
