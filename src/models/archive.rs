//! Extraction of parameter files from downloaded model archives

use super::run_blocking;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

const PARAMS_EXTENSION: &str = "params";

/// Unpacks a downloaded model archive
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Extract the archive's parameter file to `destination`, replacing it if present
    async fn extract(&self, archive: &Path, destination: &Path) -> StoreResult<()>;
}

/// Zip archiver expecting exactly one `*.params` entry
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiver;

#[async_trait]
impl Archiver for ZipArchiver {
    async fn extract(&self, archive: &Path, destination: &Path) -> StoreResult<()> {
        let archive = archive.to_path_buf();
        let destination = destination.to_path_buf();
        run_blocking(move || extract_params(&archive, &destination)).await
    }
}

fn extract_params(archive_path: &Path, destination: &Path) -> StoreResult<()> {
    let extract_err = |reason: String| StoreError::Extract {
        archive: archive_path.to_path_buf(),
        reason,
    };

    let file = File::open(archive_path).map_err(|e| StoreError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| extract_err(e.to_string()))?;

    let mut params_index = None;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| extract_err(e.to_string()))?;
        if entry.is_dir() || !is_params_entry(entry.name()) {
            continue;
        }
        if params_index.replace(i).is_some() {
            return Err(extract_err(
                "archive contains more than one .params entry".to_string(),
            ));
        }
    }
    let index =
        params_index.ok_or_else(|| extract_err("archive contains no .params entry".to_string()))?;

    let mut entry = archive
        .by_index(index)
        .map_err(|e| extract_err(e.to_string()))?;
    tracing::debug!(
        archive = ?archive_path,
        entry = %entry.name(),
        destination = ?destination,
        "Extracting parameter file"
    );

    // Write beside the destination and rename so readers never see a partial file
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".extract-")
        .tempfile_in(parent)
        .map_err(|e| StoreError::io(parent, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        std::io::copy(&mut entry, &mut writer).map_err(|e| extract_err(e.to_string()))?;
        std::io::Write::flush(&mut writer).map_err(|e| StoreError::io(tmp.path(), e))?;
    }
    tmp.persist(destination)
        .map_err(|e| StoreError::io(destination, e.error))?;

    Ok(())
}

fn is_params_entry(name: &str) -> bool {
    PathBuf::from(name)
        .extension()
        .is_some_and(|ext| ext == PARAMS_EXTENSION)
}
