//! Disk cache partitions.
//!
//! Each partition is a directory of files named by the blake3 digest of the
//! encoded cache key. Writes are staged in memory until they reach disk so a
//! read racing a write still sees the bytes.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::cache::CacheKey;
use crate::error::CacheError;
use crate::memory::{BufferRef, PooledBufferFactory};

/// Asynchronous encoded-bytes store.
#[async_trait]
pub trait DiskCache: Send + Sync {
    /// Name used in logs ("main", "small").
    fn name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<BufferRef>, CacheError>;

    async fn put(&self, key: &CacheKey, buffer: BufferRef) -> Result<(), CacheError>;

    async fn contains(&self, key: &CacheKey) -> bool;

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

/// Directory-backed partition with a byte budget.
pub struct FileDiskCache {
    name: &'static str,
    dir: PathBuf,
    max_bytes: u64,
    factory: PooledBufferFactory,
    staging: Mutex<HashMap<CacheKey, BufferRef>>,
}

impl FileDiskCache {
    pub fn new(
        name: &'static str,
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        factory: PooledBufferFactory,
    ) -> Self {
        Self {
            name,
            dir: dir.into(),
            max_bytes,
            factory,
            staging: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.cnt", key.resource_id()))
    }

    fn io_error(&self, source: io::Error) -> CacheError {
        CacheError::Io {
            tier: self.name,
            source,
        }
    }

    fn staged(&self, key: &CacheKey) -> Option<BufferRef> {
        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn unstage(&self, key: &CacheKey) {
        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    async fn write_file(&self, key: &CacheKey, buffer: &BufferRef) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.io_error(e))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, buffer.as_slice())
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Delete the oldest entries until the partition fits its budget.
    async fn trim_to_budget(&self) -> Result<(), CacheError> {
        let mut entries: Vec<(SystemTime, u64, PathBuf)> = Vec::new();
        let mut total = 0u64;
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| self.io_error(e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| self.io_error(e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cnt") {
                continue;
            }
            let meta = entry.metadata().await.map_err(|e| self.io_error(e))?;
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            total += meta.len();
            entries.push((modified, meta.len(), path));
        }
        if total <= self.max_bytes {
            return Ok(());
        }
        entries.sort_by_key(|(modified, _, _)| *modified);
        for (_, len, path) in entries {
            if total <= self.max_bytes {
                break;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => total = total.saturating_sub(len),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.io_error(e)),
            }
        }
        tracing::debug!("{} disk cache trimmed to {} bytes", self.name, total);
        Ok(())
    }
}

#[async_trait]
impl DiskCache for FileDiskCache {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<BufferRef>, CacheError> {
        if let Some(staged) = self.staged(key) {
            return Ok(Some(staged));
        }
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(self.factory.from_slice(&bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn put(&self, key: &CacheKey, buffer: BufferRef) -> Result<(), CacheError> {
        if buffer.len() as u64 > self.max_bytes {
            return Err(CacheError::Rejected {
                tier: self.name,
                message: format!("{} bytes exceeds budget of {}", buffer.len(), self.max_bytes),
            });
        }
        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), std::sync::Arc::clone(&buffer));
        let written = self.write_file(key, &buffer).await;
        self.unstage(key);
        written?;
        self.trim_to_budget().await
    }

    async fn contains(&self, key: &CacheKey) -> bool {
        self.staged(key).is_some() || tokio::fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.unstage(key);
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}
