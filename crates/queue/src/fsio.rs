//! Filesystem helpers shared by the producer and consumer sides.
//!
//! Every write goes to a hidden sibling temp file which is flushed, synced
//! and renamed over the target, so a reader never observes a truncated
//! file. Directory scans skip hidden entries for the same reason.

use std::path::{Path, PathBuf};

use image::ImageFormat;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::QueueError;

/// Extension used when the payload is not a recognised image.
pub const FALLBACK_IMAGE_EXTENSION: &str = "bin";

/// Pick the on-disk extension for an image payload from its magic bytes.
pub fn image_extension(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "png",
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(ImageFormat::WebP) => "webp",
        _ => FALLBACK_IMAGE_EXTENSION,
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()))
}

/// Write `bytes` to `path` via temp file + fsync + rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), QueueError> {
    let tmp = temp_path_for(path);

    let result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| QueueError::io(&tmp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| QueueError::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| QueueError::io(&tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| QueueError::io(path, e))
    }
    .await;

    if result.is_err() {
        // Best effort; the temp name is hidden from scans either way.
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), QueueError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| QueueError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    write_atomic(path, &bytes).await
}

/// Read and parse a JSON file. `Ok(None)` when the file does not exist.
pub async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, QueueError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(QueueError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| QueueError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
}

pub async fn create_dir_all(path: &Path) -> Result<(), QueueError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| QueueError::io(path, e))
}

pub async fn exists(path: &Path) -> Result<bool, QueueError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| QueueError::io(path, e))
}

/// Names of the visible subdirectories of `root`. A missing root is empty.
pub async fn list_subdirectories(root: &Path) -> Result<Vec<String>, QueueError> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(QueueError::io(root, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| QueueError::io(root, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| QueueError::io(entry.path(), e))?;
        if file_type.is_dir() {
            names.push(name);
        }
    }
    Ok(names)
}

/// Find the `image.*` file inside a pointer directory.
pub async fn find_image_file(dir: &Path) -> Result<Option<PathBuf>, QueueError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(QueueError::io(dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| QueueError::io(dir, e))?
    {
        let path = entry.path();
        if path.file_stem().is_some_and(|stem| stem == "image") {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
