//! Directory Full Scan
//!
//! Stand-in engine used when no index is configured: a single dataset
//! holding every regular file under the sample root. The index query is
//! ignored, so every file becomes a candidate.

use super::client::{StorageError, StorageQueryClient};
use super::types::{Dataset, DatasetId, ObjectId, StorageQuery};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const LOCAL_DATASET: &str = "local";

pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Relative, `/`-separated paths of every file under `root`, sorted.
fn scan(root: &Path) -> Result<Vec<ObjectId>, StorageError> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        files.push(ObjectId(parts.join("/")));
    }

    files.sort();
    Ok(files)
}

#[async_trait]
impl StorageQueryClient for DirectoryStorage {
    async fn topology(&self) -> Result<Vec<Dataset>, StorageError> {
        Ok(vec![Dataset::new(LOCAL_DATASET)])
    }

    async fn query(
        &self,
        _query: &StorageQuery,
        dataset: &DatasetId,
    ) -> Result<Vec<ObjectId>, StorageError> {
        if dataset.0 != LOCAL_DATASET {
            return Err(StorageError::Rejected(format!("unknown dataset {}", dataset)));
        }

        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))??;

        tracing::debug!("Full scan of {:?} found {} files", self.root, files.len());
        Ok(files)
    }
}
