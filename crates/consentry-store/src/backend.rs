//! Key/value storage backends for consent persistence.
//!
//! `StorageBackend` models in-process key/value storage (browser local
//! storage, or a JSON file per key on native hosts). Backends are injected
//! into the store so core logic is testable without a real browser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use consentry_core::Result;

/// Synchronous in-process key/value storage.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str);

    /// Probe whether writes stick. Checked once at store construction; a
    /// backend that fails the probe is treated as disabled.
    fn available(&self) -> bool {
        let key = "__consentry_probe__";
        if self.set(key, "1").is_err() {
            return false;
        }
        let ok = self.get(key).as_deref() == Some("1");
        self.remove(key);
        ok
    }
}

/// Volatile in-memory backend. Shared across stores in tests to model two
/// browsing contexts reading the same storage.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

/// File-per-key backend for native hosts. Writes go through a temp file and
/// rename, so a reader never observes a half-written record.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.path_for(key));
    }
}
