//! Sample Store
//!
//! Read-only access to the object contents. Object ids are paths relative
//! to the store root; anything that could escape the root is refused.

use crate::error::CoordinationError;
use crate::storage::types::ObjectId;

use std::path::{Component, Path, PathBuf};

pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an object id onto a path under the root.
    pub fn resolve(&self, object: &ObjectId) -> Result<PathBuf, CoordinationError> {
        let relative = Path::new(object.as_str());

        let escapes = relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(CoordinationError::ObjectProcessingError {
                object: object.clone(),
                reason: "object path escapes the sample root".to_string(),
            });
        }

        Ok(self.root.join(relative))
    }

    pub async fn read(&self, object: &ObjectId) -> Result<Vec<u8>, CoordinationError> {
        let path = self.resolve(object)?;

        tokio::fs::read(&path)
            .await
            .map_err(|e| CoordinationError::ObjectProcessingError {
                object: object.clone(),
                reason: e.to_string(),
            })
    }
}
