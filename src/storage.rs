use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

pub const TIMERS_KEY: &str = "timers-storage";
pub const DEFAULT_TIMERS_KEY: &str = "default-timers-storage";
pub const ALARMS_KEY: &str = "alarms-storage";
pub const DEFAULT_ALARMS_KEY: &str = "default-alarms-storage";
pub const LAST_VISIT_KEY: &str = "last-visit-timestamp";

/// Synchronous string key-value persistence. Values are JSON text, the same
/// shape a browser's localStorage would hold.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String) -> Result<()>;
}

pub type SharedStore = Rc<RefCell<dyn KeyValueStore>>;

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// All keys live in one JSON object on disk. Every `set` rewrites the file
/// through a temporary sibling and a rename so a crash never leaves half a
/// document behind.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileStore {
    pub fn open(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("unable to read data file {}", path.display()))?;
            parse_entries(&content, path)
        } else {
            debug!("data file {} does not exist yet", path.display());
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, format!("{text}\n"))
            .with_context(|| format!("unable to write data file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("unable to replace data file {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        self.flush()
    }
}

fn parse_entries(content: &str, path: &Path) -> BTreeMap<String, String> {
    if content.trim().is_empty() {
        return BTreeMap::new();
    }
    match serde_json::from_str::<BTreeMap<String, String>>(content) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(
                "data file {} is not a key/value document (line {}, column {}): {err}; starting empty",
                path.display(),
                err.line(),
                err.column()
            );
            BTreeMap::new()
        }
    }
}

/// Reads a JSON array of records. Returns `None` when the key is missing or
/// the value is not an array; individual records that fail to decode are
/// dropped with a warning instead of discarding the whole list.
pub fn load_records<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<Vec<T>> {
    let raw = store.get(key)?;
    let items = match serde_json::from_str::<Vec<Value>>(&raw) {
        Ok(items) => items,
        Err(err) => {
            warn!("malformed '{key}' in storage, falling back: {err}");
            return None;
        }
    };

    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<T>(item) {
            Ok(record) => records.push(record),
            Err(err) => warn!("dropping malformed record #{index} of '{key}': {err}"),
        }
    }
    Some(records)
}

pub fn save_records<T: Serialize>(store: &mut dyn KeyValueStore, key: &str, records: &[T]) -> Result<()> {
    let text = serde_json::to_string(records)?;
    store.set(key, text)
}

pub fn read_last_visit(store: &dyn KeyValueStore) -> Option<i64> {
    let raw = store.get(LAST_VISIT_KEY)?;
    match raw.trim().trim_matches('"').parse::<i64>() {
        Ok(value) if value > 0 => Some(value),
        Ok(_) | Err(_) => {
            warn!("ignoring unusable {LAST_VISIT_KEY} value '{raw}'");
            None
        }
    }
}

pub fn write_last_visit(store: &mut dyn KeyValueStore, now_ms: i64) -> Result<()> {
    store.set(LAST_VISIT_KEY, now_ms.to_string())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tempfile::tempdir;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Item {
        id: String,
        value: u32,
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.json");
        {
            let mut store = FileStore::open(&path).expect("open");
            store.set("a", "1".to_string()).expect("set");
            store.set("b", "[]".to_string()).expect("set");
        }
        let reopened = FileStore::open(&path).expect("reopen");
        assert_eq!(reopened.get("a").as_deref(), Some("1"));
        assert_eq!(reopened.get("b").as_deref(), Some("[]"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.json");
        fs::write(&path, "{ not json").expect("write");
        let store = FileStore::open(&path).expect("open");
        assert!(store.get(TIMERS_KEY).is_none());
    }

    #[test]
    fn load_records_skips_bad_entries() {
        let mut store = MemoryStore::new();
        store
            .set(
                "items",
                r#"[{"id":"a","value":1},{"id":"b","value":"oops"},{"id":"c","value":3}]"#
                    .to_string(),
            )
            .expect("set");
        let items: Vec<Item> = load_records(&store, "items").expect("array");
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].id, "c");
    }

    #[test]
    fn load_records_reports_missing_and_malformed_as_none() {
        let mut store = MemoryStore::new();
        assert!(load_records::<Item>(&store, "items").is_none());
        store.set("items", "{broken".to_string()).expect("set");
        assert!(load_records::<Item>(&store, "items").is_none());
    }

    #[test]
    fn last_visit_accepts_plain_and_quoted_numbers() {
        let mut store = MemoryStore::new();
        assert_eq!(read_last_visit(&store), None);
        write_last_visit(&mut store, 1_700_000_000_000).expect("write");
        assert_eq!(read_last_visit(&store), Some(1_700_000_000_000));
        store
            .set(LAST_VISIT_KEY, "\"1700000000500\"".to_string())
            .expect("set");
        assert_eq!(read_last_visit(&store), Some(1_700_000_000_500));
        store.set(LAST_VISIT_KEY, "yesterday".to_string()).expect("set");
        assert_eq!(read_last_visit(&store), None);
    }
}
