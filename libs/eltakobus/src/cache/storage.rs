//! Cache storage backends

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BusError, Result};
use crate::message::Esp2Message;

/// What a cached reply answered
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheKey {
    /// The coordinator's answer to the lock request
    CoordinatorReply,
    Discover { address: u8 },
    Read { address: u8, row: u8 },
    /// A whole memory dump of one device
    Memory { address: u8 },
}

impl CacheKey {
    /// Whether this entry describes the memory of the device at `address`
    pub fn is_memory_of(&self, device: u8) -> bool {
        match self {
            CacheKey::Read { address, .. } | CacheKey::Memory { address } => *address == device,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheValue {
    /// Reply telegram; a recorded timeout is stored as the timeout telegram
    Reply(Esp2Message),
    Memory(Vec<[u8; 8]>),
}

/// Keyed store behind a response cache
pub trait CacheStorage: Send {
    fn get(&self, key: &CacheKey) -> Option<CacheValue>;

    fn insert(&mut self, key: CacheKey, value: CacheValue) -> Result<()>;

    /// Remove every entry whose key matches; returns how many were removed
    fn remove_where(&mut self, predicate: &dyn Fn(&CacheKey) -> bool) -> Result<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory storage, lost with the process
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: HashMap<CacheKey, CacheValue>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStorage for MemoryStorage {
    fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, value: CacheValue) -> Result<()> {
        self.entries.insert(key, value);
        Ok(())
    }

    fn remove_where(&mut self, predicate: &dyn Fn(&CacheKey) -> bool) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        Ok(before - self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// JSON file storage, rewritten on every change
///
/// Writes go to a sibling `.tmp` file that is then renamed over the cache
/// file, so a crash never leaves a half-written cache behind.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: MemoryStorage,
}

impl FileStorage {
    /// Load `path` if it exists, otherwise start empty
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = MemoryStorage::new();

        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                BusError::storage(format!("Failed to read cache file {}: {e}", path.display()))
            })?;
            let stored: Vec<(CacheKey, CacheValue)> = serde_json::from_str(&content)?;
            entries.entries.extend(stored);
            debug!(path = %path.display(), entries = entries.len(), "Loaded cache file");
        }

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let stored: Vec<(&CacheKey, &CacheValue)> = self.entries.entries.iter().collect();
        let content = serde_json::to_string(&stored)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content).map_err(|e| {
            BusError::storage(format!("Failed to write cache file {}: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            BusError::storage(format!(
                "Failed to move cache file into place at {}: {e}",
                self.path.display()
            ))
        })
    }
}

impl CacheStorage for FileStorage {
    fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: CacheKey, value: CacheValue) -> Result<()> {
        self.entries.insert(key, value)?;
        self.persist()
    }

    fn remove_where(&mut self, predicate: &dyn Fn(&CacheKey) -> bool) -> Result<usize> {
        let removed = self.entries.remove_where(predicate)?;
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
