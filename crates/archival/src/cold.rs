//! Cold tier blob storage.
//!
//! Blobs are addressed by `/`-separated relative paths such as
//! `aggregates/3f/a2/<id>/events_2024_01.json.gz`.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{ArchivalError, Result};

const TEMP_SUFFIX: &str = ".tmp";

/// Object storage for archived events.
#[async_trait]
pub trait ColdStorage: Send + Sync {
    /// Writes a blob, replacing any previous content.
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Reads a blob. `None` if it does not exist.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Removes a blob. Returns true if it existed.
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Paths starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size of a blob in bytes. `None` if it does not exist.
    async fn size(&self, path: &str) -> Result<Option<u64>>;
}

/// [`ColdStorage`] on a local directory.
///
/// Writes go to a temporary sibling, are synced, then renamed into place, so
/// a reader never sees a partial blob.
#[derive(Debug, Clone)]
pub struct FilesystemColdStorage {
    root: PathBuf,
}

impl FilesystemColdStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !safe {
            return Err(ArchivalError::storage(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "path escapes the archive root"),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn relative(&self, full: &Path) -> Option<String> {
        let rel = full.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ColdStorage for FilesystemColdStorage {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ArchivalError::storage(path, e))?;
        }

        let mut temp = target.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);

        let write = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp, &target).await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&temp).await;
            return Err(ArchivalError::storage(path, e));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArchivalError::storage(path, e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.resolve(path)?)
            .await
            .map_err(|e| ArchivalError::storage(path, e))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        match fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ArchivalError::storage(path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // start from the deepest directory the prefix names
        let start = match prefix.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => self.resolve(dir)?,
            _ => self.root.clone(),
        };

        let mut found = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ArchivalError::storage(dir.display().to_string(), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ArchivalError::storage(dir.display().to_string(), e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| ArchivalError::storage(path.display().to_string(), e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Some(rel) = self.relative(&path)
                    && rel.starts_with(prefix)
                    && !rel.ends_with(TEMP_SUFFIX)
                {
                    found.push(rel);
                }
            }
        }

        found.sort();
        Ok(found)
    }

    async fn size(&self, path: &str) -> Result<Option<u64>> {
        match fs::metadata(self.resolve(path)?).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArchivalError::storage(path, e)),
        }
    }
}

/// Process-local [`ColdStorage`] for tests and single-node setups.
#[derive(Debug, Clone, Default)]
pub struct InMemoryColdStorage {
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryColdStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl ColdStorage for InMemoryColdStorage {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(path).cloned())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(path).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, _)| path.clone())
            .collect())
    }

    async fn size(&self, path: &str) -> Result<Option<u64>> {
        Ok(self
            .blobs
            .read()
            .await
            .get(path)
            .map(|data| data.len() as u64))
    }
}
