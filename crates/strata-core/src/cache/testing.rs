//! Storage doubles shared by the cache tests

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use strata_storage::{LocalStorage, StorageBackend, StorageError};
use tokio::sync::Notify;

/// Local storage whose next read can be held after the data is fetched
pub(crate) struct PausingStorage {
    inner: LocalStorage,
    armed: AtomicBool,
    paused: Notify,
    resume: Notify,
}

impl PausingStorage {
    pub(crate) fn new(inner: LocalStorage) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            paused: Notify::new(),
            resume: Notify::new(),
        }
    }

    /// Hold the next `read` once it has its data
    pub(crate) fn pause_next_read(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a read is being held
    pub(crate) async fn wait_paused(&self) {
        self.paused.notified().await;
    }

    pub(crate) fn resume(&self) {
        self.resume.notify_one();
    }
}

#[async_trait]
impl StorageBackend for PausingStorage {
    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.exists(name).await
    }

    async fn read(&self, name: &str) -> Result<Bytes, StorageError> {
        let data = self.inner.read(name).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.paused.notify_one();
            self.resume.notified().await;
        }
        Ok(data)
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<(), StorageError> {
        self.inner.write(name, data).await
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.delete(name).await
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        self.inner.list().await
    }

    fn storage_path(&self, name: &str) -> String {
        self.inner.storage_path(name)
    }
}
