/**
 * ============================================================================
 * SETTINGS STORAGE MODULE
 * ============================================================================
 *
 * PURPOSE: Durable key-value storage for the persisted client state
 *
 * CAPABILITY (SettingsStore):
 * - get_string / set_string: plain string values
 * - get_string_map / set_map: string-to-string maps
 * - remove: delete a key of either kind
 *
 * IMPLEMENTATIONS:
 * - MemorySettingsStore: process-lifetime only, clones share one map
 * - JsonFileSettingsStore: single JSON document, atomic rewrite per write
 *
 * The store is assumed to have one in-process owner. Concurrent access from
 * several processes is the host application's responsibility.
 *
 * ============================================================================
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/**
 * Durable key-value settings capability
 * Writes return Err with a message when the value could not be persisted
 */
pub trait SettingsStore: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;

    fn set_string(&self, key: &str, value: &str) -> Result<(), String>;

    fn get_string_map(&self, key: &str) -> Option<BTreeMap<String, String>>;

    fn set_map(&self, key: &str, value: &BTreeMap<String, String>) -> Result<(), String>;

    fn remove(&self, key: &str) -> Result<(), String>;
}

/**
 * A single stored entry
 * Untagged so the JSON file reads naturally: strings and objects
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Text(String),
    Map(BTreeMap<String, String>),
}

type Entries = BTreeMap<String, StoredValue>;

fn lock_entries(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_string(entries: &Entries, key: &str) -> Option<String> {
    match entries.get(key) {
        Some(StoredValue::Text(value)) => Some(value.clone()),
        _ => None,
    }
}

fn read_map(entries: &Entries, key: &str) -> Option<BTreeMap<String, String>> {
    match entries.get(key) {
        Some(StoredValue::Map(value)) => Some(value.clone()),
        _ => None,
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/**
 * Non-durable store
 * Clones share the same backing map, so building a second client over a
 * clone behaves like a restart against the same storage
 */
#[derive(Debug, Clone, Default)]
pub struct MemorySettingsStore {
    entries: Arc<Mutex<Entries>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        lock_entries(&self.entries).contains_key(key)
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get_string(&self, key: &str) -> Option<String> {
        read_string(&lock_entries(&self.entries), key)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), String> {
        lock_entries(&self.entries).insert(key.to_string(), StoredValue::Text(value.to_string()));
        Ok(())
    }

    fn get_string_map(&self, key: &str) -> Option<BTreeMap<String, String>> {
        read_map(&lock_entries(&self.entries), key)
    }

    fn set_map(&self, key: &str, value: &BTreeMap<String, String>) -> Result<(), String> {
        lock_entries(&self.entries).insert(key.to_string(), StoredValue::Map(value.clone()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        lock_entries(&self.entries).remove(key);
        Ok(())
    }
}

// =============================================================================
// JSON File Store
// =============================================================================

/**
 * File-backed store
 * Keeps all entries in memory and rewrites the whole document on every
 * write. A write only lands in memory once the file has been replaced.
 */
#[derive(Debug)]
pub struct JsonFileSettingsStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl JsonFileSettingsStore {
    /**
     * Open (or create on first write) the store at `path`
     * A corrupt file is logged and treated as empty
     */
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();

        let entries = if path.exists() {
            let json_str = fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read settings file: {}", e))?;
            match serde_json::from_str::<Entries>(&json_str) {
                Ok(entries) => {
                    log::info!("[MP-STORE] Loaded {} settings from {}", entries.len(), path.display());
                    entries
                }
                Err(e) => {
                    log::warn!("[MP-STORE] Settings file {} is corrupt, starting empty: {}", path.display(), e);
                    Entries::new()
                }
            }
        } else {
            log::info!("[MP-STORE] No settings file at {}, starting empty", path.display());
            Entries::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /**
     * Default location: {data_dir}/{app_name}/measurement_settings.json
     */
    pub fn default_path(app_name: &str) -> Result<PathBuf, String> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| "Failed to resolve platform data directory".to_string())?;
        Ok(data_dir.join(app_name).join("measurement_settings.json"))
    }

    /**
     * Apply a change to a copy of the entries, persist it, then commit
     */
    fn update<F>(&self, change: F) -> Result<(), String>
    where
        F: FnOnce(&mut Entries),
    {
        let mut entries = lock_entries(&self.entries);
        let mut next = entries.clone();
        change(&mut next);
        self.write_file(&next)?;
        *entries = next;
        Ok(())
    }

    fn write_file(&self, entries: &Entries) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }

        let json_str = serde_json::to_string_pretty(entries)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json_str)
            .map_err(|e| format!("Failed to write temporary settings file: {}", e))?;

        fs::rename(&temp_path, &self.path)
            .map_err(|e| format!("Failed to save settings file: {}", e))?;

        Ok(())
    }
}

impl SettingsStore for JsonFileSettingsStore {
    fn get_string(&self, key: &str) -> Option<String> {
        read_string(&lock_entries(&self.entries), key)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), String> {
        self.update(|entries| {
            entries.insert(key.to_string(), StoredValue::Text(value.to_string()));
        })
    }

    fn get_string_map(&self, key: &str) -> Option<BTreeMap<String, String>> {
        read_map(&lock_entries(&self.entries), key)
    }

    fn set_map(&self, key: &str, value: &BTreeMap<String, String>) -> Result<(), String> {
        self.update(|entries| {
            entries.insert(key.to_string(), StoredValue::Map(value.clone()));
        })
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        if !lock_entries(&self.entries).contains_key(key) {
            return Ok(());
        }
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> BTreeMap<String, String> {
        [("tier".to_string(), "gold".to_string())].into_iter().collect()
    }

    #[test]
    fn test_memory_store_kinds_are_separate() {
        let store = MemorySettingsStore::new();
        store.set_string("device", "abc").unwrap();
        store.set_map("props", &sample_map()).unwrap();

        assert_eq!(store.get_string("device").as_deref(), Some("abc"));
        assert_eq!(store.get_string_map("props"), Some(sample_map()));

        // Reading a key as the wrong kind yields nothing
        assert_eq!(store.get_string("props"), None);
        assert_eq!(store.get_string_map("device"), None);

        store.remove("props").unwrap();
        assert!(!store.contains_key("props"));
    }

    #[test]
    fn test_memory_store_clones_share_entries() {
        let store = MemorySettingsStore::new();
        let other = store.clone();
        store.set_string("user", "u-1").unwrap();
        assert_eq!(other.get_string("user").as_deref(), Some("u-1"));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings").join("measurement_settings.json");

        {
            let store = JsonFileSettingsStore::open(&path).unwrap();
            store.set_string("device", "abc").unwrap();
            store.set_map("props", &sample_map()).unwrap();
            store.set_string("gone", "x").unwrap();
            store.remove("gone").unwrap();
        }

        let reopened = JsonFileSettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get_string("device").as_deref(), Some("abc"));
        assert_eq!(reopened.get_string_map("props"), Some(sample_map()));
        assert_eq!(reopened.get_string("gone"), None);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_file_store_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("measurement_settings.json");
        fs::write(&path, "{ this is not json").unwrap();

        let store = JsonFileSettingsStore::open(&path).unwrap();
        assert_eq!(store.get_string("device"), None);

        store.set_string("device", "fresh").unwrap();
        let reopened = JsonFileSettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get_string("device").as_deref(), Some("fresh"));
    }
}
