//! File-backed cache storage.
//!
//! Layout under the root directory:
//!
//! ```text
//! {root}/
//!     nbs-pwa-pages-v2/
//!         {sha256(request key)}.json
//!     nbs-pwa-assets-v2/
//!         ...
//! ```
//!
//! Each entry file holds the request key next to the snapshot so a listing
//! can recover keys without a separate index. Writes land in a uniquely
//! named temp file first and are then renamed over the target, which keeps
//! every single-key put atomic for concurrent readers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use nbs_common::ResultExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, trace, warn};

use crate::cache::{CacheBackend, CacheEntry, RequestKey};
use crate::naming::validate_component;
use crate::Result;

const ENTRY_EXT: &str = "json";

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: RequestKey,
    entry: CacheEntry,
}

/// Cache backend persisting partitions as directories of JSON files.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    /// Use `root` as the storage directory, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.with_path(&root)?;
        debug!(root = %root.display(), "Disk cache backend opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, cache: &str) -> Result<PathBuf> {
        validate_component("cache", cache)?;
        Ok(self.root.join(cache))
    }

    fn entry_path(&self, cache: &str, key: &RequestKey) -> Result<PathBuf> {
        Ok(self
            .partition_dir(cache)?
            .join(format!("{}.{}", entry_file_stem(key), ENTRY_EXT)))
    }

    async fn read_entry(path: &Path) -> Result<Option<StoredEntry>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(nbs_common::NbsError::storage(path, e.to_string()).into()),
        };
        let stored = serde_json::from_slice(&bytes).with_path(path)?;
        Ok(Some(stored))
    }
}

fn entry_file_stem(key: &RequestKey) -> String {
    hex::encode(Sha256::digest(key.as_str().as_bytes()))
}

fn temp_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!(
        "{}.{}.tmp",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[async_trait]
impl CacheBackend for DiskBackend {
    async fn create(&self, cache: &str) -> Result<bool> {
        let dir = self.partition_dir(cache)?;
        if fs::try_exists(&dir).await.with_path(&dir)? {
            return Ok(false);
        }
        fs::create_dir_all(&dir).await.with_path(&dir)?;
        trace!(cache, "Partition directory created");
        Ok(true)
    }

    async fn has(&self, cache: &str) -> Result<bool> {
        let dir = self.partition_dir(cache)?;
        Ok(fs::try_exists(&dir).await.with_path(&dir)?)
    }

    async fn delete(&self, cache: &str) -> Result<bool> {
        let dir = self.partition_dir(cache)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(nbs_common::NbsError::storage(&dir, e.to_string()).into()),
        }
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await.with_path(&self.root)?;
        while let Some(item) = dir.next_entry().await.with_path(&self.root)? {
            let is_dir = item
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(name) = item.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(cache, key)?;
        Ok(Self::read_entry(&path)
            .await?
            .filter(|stored| &stored.key == key)
            .map(|stored| stored.entry))
    }

    async fn put(&self, cache: &str, key: &RequestKey, entry: CacheEntry) -> Result<()> {
        let dir = self.partition_dir(cache)?;
        fs::create_dir_all(&dir).await.with_path(&dir)?;

        let path = self.entry_path(cache, key)?;
        let temp = path.with_extension(format!("{}.{}", ENTRY_EXT, temp_suffix()));
        let stored = StoredEntry {
            key: key.clone(),
            entry,
        };
        let json = serde_json::to_vec(&stored).with_path(&path)?;

        fs::write(&temp, json).await.with_path(&temp)?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(nbs_common::NbsError::storage(&path, e.to_string()).into());
        }
        trace!(cache, key = %key, "Entry written");
        Ok(())
    }

    async fn remove(&self, cache: &str, key: &RequestKey) -> Result<bool> {
        let path = self.entry_path(cache, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(nbs_common::NbsError::storage(&path, e.to_string()).into()),
        }
    }

    async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>> {
        let dir_path = self.partition_dir(cache)?;
        let mut dir = match fs::read_dir(&dir_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(nbs_common::NbsError::storage(&dir_path, e.to_string()).into()),
        };

        let mut keys = Vec::new();
        while let Some(item) = dir.next_entry().await.with_path(&dir_path)? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            match Self::read_entry(&path).await {
                Ok(Some(stored)) => keys.push(stored.key),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
