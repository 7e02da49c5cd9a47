//! Directory backed by a shared filesystem (a volume mounted by every peer).
//!
//! Each peer's bucket is a JSON object stored in `<root>/<unit>.json`.
//! Writes go to a temporary file that is renamed into place, so readers
//! never observe a half-written bucket.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::warn;
use tokio::fs;

use super::DirectoryStore;
use crate::error::{GlueError, Result};
use crate::types::UnitId;

type Bucket = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct FileDirectory {
    root: PathBuf,
}

impl FileDirectory {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| GlueError::directory(format!("{}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    fn bucket_path(&self, unit: &UnitId) -> PathBuf {
        self.root.join(format!("{}.json", unit))
    }

    async fn read_bucket(&self, path: &Path) -> Result<Option<Bucket>> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(GlueError::directory(format!("{}: {}", path.display(), e))),
        };
        match serde_json::from_slice(&raw) {
            Ok(bucket) => Ok(Some(bucket)),
            Err(e) => {
                warn!("Ignoring malformed bucket {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl DirectoryStore for FileDirectory {
    async fn put(&self, owner: &UnitId, key: &str, value: &str) -> Result<()> {
        let path = self.bucket_path(owner);
        let mut bucket = self.read_bucket(&path).await?.unwrap_or_default();
        if bucket.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        bucket.insert(key.to_string(), value.to_string());

        let bytes = serde_json::to_vec_pretty(&bucket)
            .map_err(|e| GlueError::directory(format!("serialising bucket: {}", e)))?;
        let tmp = self.root.join(format!(".{}.json.tmp", owner));
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| GlueError::directory(format!("{}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| GlueError::directory(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn get(&self, unit: &UnitId, key: &str) -> Result<Option<String>> {
        let bucket = self.read_bucket(&self.bucket_path(unit)).await?;
        Ok(bucket.and_then(|mut b| b.remove(key)))
    }

    async fn members(&self) -> Result<Vec<UnitId>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| GlueError::directory(format!("{}: {}", self.root.display(), e)))?;

        let mut members = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(GlueError::directory)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(unit) = name.strip_suffix(".json") {
                members.push(UnitId::new(unit));
            }
        }
        Ok(members)
    }

    async fn depart(&self, owner: &UnitId) -> Result<()> {
        match fs::remove_file(self.bucket_path(owner)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GlueError::directory(e)),
        }
    }
}
