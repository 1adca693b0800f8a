//! File-backed cache with LRU eviction under entry-count and byte-size caps.
//!
//! Each entry is one JSON file named by a hash of the key. Recency is tracked in
//! memory and seeded from file modification times at construction, so restarts keep
//! an approximate LRU order. TTL is honoured via an `expires_at` field in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{Cache, CacheError};

#[derive(Serialize, Deserialize)]
struct FileEntry<V> {
    value: V,
    /// Unix millis; absent means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Hashes a cache key into a stable file name. SHA-256 keeps names
/// collision-resistant across keys and stable across releases; entries carry no
/// copy of the original key, so the file name is the only identity.
pub fn key_file_name(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}.json", hex)
}

/// JSON-file cache for string keys. Oldest entries are evicted first once either the
/// entry-count cap or the byte-size cap is exceeded.
pub struct FileCache<V> {
    dir: PathBuf,
    max_entries: usize,
    max_bytes: u64,
    /// Least-recent first.
    order: Mutex<Vec<String>>,
    _marker: std::marker::PhantomData<fn() -> V>,
}

impl<V> FileCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Opens (or creates) a cache directory. Existing files seed the recency order by
    /// modification time, oldest first.
    pub fn new(
        dir: impl AsRef<Path>,
        max_entries: usize,
        max_bytes: u64,
    ) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut existing: Vec<(String, std::time::SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            existing.push((name, modified));
        }
        existing.sort_by_key(|(_, modified)| *modified);

        Ok(Self {
            dir,
            max_entries: max_entries.max(1),
            max_bytes,
            order: Mutex::new(existing.into_iter().map(|(name, _)| name).collect()),
            _marker: std::marker::PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn len(&self) -> usize {
        self.order.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.order.lock().await.is_empty()
    }

    fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    fn total_bytes(&self, order: &[String]) -> u64 {
        order
            .iter()
            .filter_map(|name| std::fs::metadata(self.path_for(name)).ok())
            .map(|m| m.len())
            .sum()
    }

    /// Evicts least-recent entries until both caps hold.
    fn enforce_caps(&self, order: &mut Vec<String>) {
        while order.len() > self.max_entries
            || (self.max_bytes > 0 && self.total_bytes(order) > self.max_bytes && order.len() > 1)
        {
            let name = order.remove(0);
            let _ = std::fs::remove_file(self.path_for(&name));
        }
    }

    fn touch(order: &mut Vec<String>, name: &str) {
        if let Some(pos) = order.iter().position(|n| n == name) {
            let entry = order.remove(pos);
            order.push(entry);
        }
    }
}

#[async_trait]
impl<V> Cache<String, V> for FileCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    async fn get(&self, key: &String) -> Option<V> {
        let name = key_file_name(key);
        let path = self.path_for(&name);
        let content = std::fs::read_to_string(&path).ok()?;
        let entry: FileEntry<V> = serde_json::from_str(&content).ok()?;
        if let Some(expires_at) = entry.expires_at {
            if now_millis() > expires_at {
                let _ = std::fs::remove_file(&path);
                let mut order = self.order.lock().await;
                order.retain(|n| n != &name);
                return None;
            }
        }
        let mut order = self.order.lock().await;
        Self::touch(&mut order, &name);
        Some(entry.value)
    }

    async fn set(&self, key: String, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let name = key_file_name(&key);
        let entry = FileEntry {
            value,
            expires_at: ttl.map(|d| now_millis() + d.as_millis() as u64),
        };
        std::fs::write(self.path_for(&name), serde_json::to_string(&entry)?)?;

        let mut order = self.order.lock().await;
        order.retain(|n| n != &name);
        order.push(name);
        self.enforce_caps(&mut order);
        Ok(())
    }

    async fn delete(&self, key: &String) -> Result<(), CacheError> {
        let name = key_file_name(key);
        let _ = std::fs::remove_file(self.path_for(&name));
        let mut order = self.order.lock().await;
        order.retain(|n| n != &name);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut order = self.order.lock().await;
        for name in order.drain(..) {
            let _ = std::fs::remove_file(self.path_for(&name));
        }
        Ok(())
    }
}
