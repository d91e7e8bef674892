//! Compiled-artifact caches.
//!
//! A cache stores [`CompiledUnit`]s under `path#signature` keys. `has` answers for a given
//! freshness token, so a changed template source never reuses a stale unit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::finalize::{compute_hash, CompiledUnit};
use crate::validate::{CompilerError, ErrorKind, Result};

pub trait ArtifactCache: Send + Sync {
    fn has(&self, key: &str, freshness: &str) -> bool;
    fn get(&self, key: &str) -> Option<CompiledUnit>;
    fn put(&self, key: &str, unit: &CompiledUnit) -> Result<()>;
}

/// `path#signature`, one signature letter per data source.
pub fn cache_key(path: &str, signature: &str) -> String {
    format!("{}#{}", path, signature)
}

// ═══════════════════════════════════════════════════════════════════════════════
// FILESYSTEM CACHE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    unit: CompiledUnit,
}

/// One JSON file per key inside `cache_dir`.
pub struct FsArtifactCache {
    cache_dir: PathBuf,
}

impl FsArtifactCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| io_error(&cache_dir, e))?;
        Ok(Self { cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let stem: String = key
            .chars()
            .take(48)
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        // Hash suffix keeps keys that sanitize alike apart
        self.cache_dir
            .join(format!("{}-{}.json", stem, &compute_hash(key)[..12]))
    }

    fn read_entry(&self, key: &str) -> Option<CompiledUnit> {
        let path = self.entry_path(key);
        let data = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CacheEntry>(&data) {
            Ok(entry) if entry.key == key => Some(entry.unit),
            Ok(_) => {
                warn!(key, path = %path.display(), "cache entry belongs to another key, discarding");
                fs::remove_file(&path).ok();
                None
            }
            Err(e) => {
                warn!(key, path = %path.display(), error = %e, "corrupt cache entry, discarding");
                fs::remove_file(&path).ok();
                None
            }
        }
    }
}

impl ArtifactCache for FsArtifactCache {
    fn has(&self, key: &str, freshness: &str) -> bool {
        self.read_entry(key)
            .map(|unit| unit.freshness == freshness)
            .unwrap_or(false)
    }

    fn get(&self, key: &str) -> Option<CompiledUnit> {
        self.read_entry(key)
    }

    fn put(&self, key: &str, unit: &CompiledUnit) -> Result<()> {
        let path = self.entry_path(key);
        let entry = CacheEntry {
            key: key.to_string(),
            unit: unit.clone(),
        };
        let data = serde_json::to_string(&entry).map_err(|e| {
            CompilerError::new(ErrorKind::Io, format!("Failed to encode cache entry: {}", e))
        })?;
        // Write then rename so readers never see a partial file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))?;
        debug!(key, path = %path.display(), "stored compiled unit");
        Ok(())
    }
}

fn io_error(path: &Path, error: std::io::Error) -> CompilerError {
    CompilerError::new(ErrorKind::Io, format!("{}: {}", path.display(), error))
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY CACHE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MemoryArtifactCache {
    entries: Mutex<HashMap<String, CompiledUnit>>,
}

impl MemoryArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactCache for MemoryArtifactCache {
    fn has(&self, key: &str, freshness: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(key)
                    .map(|unit| unit.freshness == freshness)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn get(&self, key: &str) -> Option<CompiledUnit> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, unit: &CompiledUnit) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CompilerError::new(ErrorKind::Io, "artifact cache lock poisoned"))?;
        entries.insert(key.to_string(), unit.clone());
        Ok(())
    }
}
