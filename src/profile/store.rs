//! Serial-keyed snapshots of device profiles.
//!
//! A device that disconnects leaves its profile here; a reattach with the
//! same serial picks it back up. The map holds at most one entry per
//! serial, and lookup/insert are atomic with respect to a concurrent
//! disconnect/reconnect of the same unit.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::debug;

use super::Profile;

#[derive(Default)]
pub struct ProfileStore {
    entries: Mutex<HashMap<String, Profile>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the stored profile for a serial, if any.
    pub fn find(&self, serial: &str) -> Option<Profile> {
        self.entries.lock().get(serial).cloned()
    }

    /// Insert or replace the entry for the profile's serial.
    pub fn put(&self, profile: Profile) {
        debug!("storing profile for S/N {}", profile.serial);
        self.entries.lock().insert(profile.serial.clone(), profile);
    }

    pub fn remove(&self, serial: &str) -> Option<Profile> {
        self.entries.lock().remove(serial)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Merge snapshots from disk into the store. Returns how many entries
    /// were loaded.
    pub fn load(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read profile store: {:?}", path))?;
        let snapshot: HashMap<String, Profile> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse profile store: {:?}", path))?;
        let count = snapshot.len();
        self.entries.lock().extend(snapshot);
        Ok(count)
    }

    /// Write every entry to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory: {:?}", parent))?;
        }
        let content = {
            let entries = self.entries.lock();
            serde_json::to_string_pretty(&*entries).context("failed to serialize profile store")?
        };
        std::fs::write(path, content)
            .with_context(|| format!("failed to write profile store: {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_entry_per_serial() {
        let store = ProfileStore::new();
        let mut profile = Profile::new("abc123");
        profile.name = "first".into();
        store.put(profile.clone());

        profile.name = "second".into();
        store.put(profile);

        assert_eq!(store.len(), 1);
        assert_eq!(store.find("abc123").unwrap().name, "second");
    }

    #[test]
    fn test_find_returns_snapshot() {
        let store = ProfileStore::new();
        store.put(Profile::new("abc123"));

        let mut found = store.find("abc123").unwrap();
        found.name = "mutated".into();
        assert_eq!(store.find("abc123").unwrap().name, "");
    }

    #[test]
    fn test_remove() {
        let store = ProfileStore::new();
        store.put(Profile::new("abc123"));
        assert!(store.remove("abc123").is_some());
        assert!(store.remove("abc123").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("profiles.json");

        let store = ProfileStore::new();
        let mut profile = Profile::new("abc123");
        profile.current = profile.ensure_mode(1);
        store.put(profile);
        store.save(&path).unwrap();

        let restored = ProfileStore::new();
        assert_eq!(restored.load(&path).unwrap(), 1);
        let found = restored.find("abc123").unwrap();
        assert_eq!(found.modes.len(), 2);
        assert_eq!(found.current, 1);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new();
        assert_eq!(store.load(&dir.path().join("none.json")).unwrap(), 0);
    }
}
