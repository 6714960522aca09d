//! Local disk storage backend

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{validate_name, StorageBackend};
use crate::error::StorageError;

/// Age after which a temp file is treated as left behind by a crashed writer
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Local disk storage backend
///
/// Stores records in a sharded directory structure:
/// `<base_path>/records/<first 2 chars>/<name>`
///
/// Writes go to `<base_path>/tmp/<uuid>.tmp` first and are renamed into
/// place, so a crash never leaves a half-written record behind.
pub struct LocalStorage {
    base_path: PathBuf,
    records_path: PathBuf,
    tmp_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage backend
    ///
    /// Temp files older than [`STALE_TEMP_AGE`] are removed. Younger ones may
    /// belong to another instance writing under the same root and are kept.
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        let records_path = base_path.join("records");
        let tmp_path = base_path.join("tmp");

        fs::create_dir_all(&records_path).await?;
        fs::create_dir_all(&tmp_path).await?;

        let storage = Self {
            base_path,
            records_path,
            tmp_path,
        };
        let purged = storage.purge_temp_files().await?;
        if purged > 0 {
            warn!("Removed {} stale temp files", purged);
        }

        info!("Initialized local storage at {:?}", storage.base_path);
        Ok(storage)
    }

    /// Get the base directory
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the file path for a record
    fn record_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        let shard = &name[..2];
        Ok(self.records_path.join(shard).join(name))
    }

    async fn purge_temp_files(&self) -> Result<usize, StorageError> {
        let mut purged = 0;
        let mut dir = fs::read_dir(&self.tmp_path).await?;
        let now = SystemTime::now();
        while let Some(entry) = dir.next_entry().await? {
            let stale = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => now
                    .duration_since(modified)
                    .is_ok_and(|age| age >= STALE_TEMP_AGE),
                Err(e) => {
                    warn!("Failed to stat temp file {:?}: {}", entry.path(), e);
                    false
                }
            };
            if !stale {
                debug!("Keeping recent temp file {:?}", entry.path());
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => purged += 1,
                Err(e) => warn!("Failed to remove temp file {:?}: {}", entry.path(), e),
            }
        }
        Ok(purged)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.record_path(name)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn read(&self, name: &str) -> Result<Bytes, StorageError> {
        let path = self.record_path(name)?;
        debug!("Reading record from {:?}", path);

        let data = fs::read(&path)
            .await
            .map_err(|e| StorageError::from_io(name, e))?;

        Ok(Bytes::from(data))
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<(), StorageError> {
        let path = self.record_path(name)?;
        debug!("Writing record to {:?} ({} bytes)", path, data.len());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.tmp_path.join(format!("{}.tmp", Uuid::new_v4()));
        let result = async {
            let mut file = File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }

        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.record_path(name)?;
        debug!("Deleting record at {:?}", path);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut shards = fs::read_dir(&self.records_path).await?;

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut records = fs::read_dir(shard.path()).await?;
            while let Some(record) = records.next_entry().await? {
                let name = record.file_name().to_string_lossy().to_string();
                if validate_name(&name).is_ok() {
                    names.push(name);
                } else {
                    debug!("Skipping foreign file {:?}", record.path());
                }
            }
        }

        Ok(names)
    }

    fn storage_path(&self, name: &str) -> String {
        self.record_path(name)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}
