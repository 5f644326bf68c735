//! Preference persistence.
//!
//! The runtime owns the preference schema. Natively we only store one opaque
//! JSON text blob under a well-known key and hand it back whole. The backing
//! file is a small JSON object so other keys can live next to it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Value returned when nothing has been stored yet.
pub const EMPTY_PREFS: &str = "{}";

/// File-backed store for the preferences blob.
pub struct PreferenceStore {
    /// Path to the storage file.
    path: PathBuf,
    /// Key the blob lives under.
    key: String,
    /// In-memory copy of the file.
    cache: HashMap<String, String>,
}

impl PreferenceStore {
    /// Open the store, loading the file if it exists.
    ///
    /// An unreadable or corrupt file starts an empty store; the next write
    /// replaces it.
    pub fn open(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        let path = path.into();

        let cache = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(target: "prefs", "ignoring corrupt {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            key: key.into(),
            cache,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored blob, or `{}`.
    pub fn get(&self) -> String {
        self.cache
            .get(&self.key)
            .cloned()
            .unwrap_or_else(|| EMPTY_PREFS.to_string())
    }

    /// Replace the blob and write it to disk.
    pub fn set(&mut self, blob: &str) -> Result<(), anyhow::Error> {
        let previous = self.cache.insert(self.key.clone(), blob.to_string());
        if let Err(e) = self.flush() {
            // Keep memory and disk in agreement
            match previous {
                Some(old) => self.cache.insert(self.key.clone(), old),
                None => self.cache.remove(&self.key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Write the file through a temp file and rename, so readers never see
    /// half a blob.
    fn flush(&self) -> Result<(), anyhow::Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create preferences directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }

        let contents = serde_json::to_string_pretty(&self.cache)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).map_err(|e| {
            anyhow::anyhow!("Failed to write preferences {}: {}", tmp.display(), e)
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            anyhow::anyhow!("Failed to replace preferences {}: {}", self.path.display(), e)
        })?;

        Ok(())
    }
}
