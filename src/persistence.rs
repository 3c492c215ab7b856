//! Durable alarm storage.
//!
//! Alarms live in a flat key-value store, one JSON record per alarm under
//! `<namespace><id>`. [`AlarmRepository`] implements the alarm-level contract
//! on top of any [`KeyValueStore`] and absorbs per-record failures.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use log::{debug, warn};
use std::{
    collections::{BTreeMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crate::alarm::{AlarmId, AlarmRecord, AlarmSnapshot};
use crate::error::PersistenceError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistenceError>;

    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    async fn set(&self, key: &str, value: String) -> Result<(), PersistenceError>;

    /// Removing a missing key succeeds.
    async fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

/// One file per key in a directory. File names are the base64url-encoded key.
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<FileKeyValueStore, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(FileKeyValueStore { dir })
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", URL_SAFE_NO_PAD.encode(key)))
    }

    fn key_for(file_name: &str) -> Option<String> {
        let stem = file_name.strip_suffix(".json")?;
        let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(key) = file_name.to_str().and_then(FileKeyValueStore::key_for) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match tokio::fs::read_to_string(self.file_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), PersistenceError> {
        let path = self.file_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        match tokio::fs::remove_file(self.file_for(key)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// In-process store. Lost on restart; can be told to fail for exercising error paths.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, String>>,
    failing_keys: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
}

impl MemoryKeyValueStore {
    pub fn new() -> MemoryKeyValueStore {
        MemoryKeyValueStore::default()
    }

    /// Make every write and removal of `key` fail.
    pub fn fail_writes_for(&self, key: &str) {
        lock(&self.failing_keys).insert(key.to_string());
    }

    /// Make every operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        lock(&self.entries).clone()
    }

    fn check(&self, key: Option<&str>) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store switched off".into()));
        }
        if let Some(key) = key {
            if lock(&self.failing_keys).contains(key) {
                return Err(PersistenceError::Unavailable(format!("writes to '{key}' are failing")));
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        self.check(None)?;
        Ok(lock(&self.entries)
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        self.check(None)?;
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), PersistenceError> {
        self.check(Some(key))?;
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.check(Some(key))?;
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Outcome of writing the whole collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub written: usize,
    pub failed: usize,
}

#[async_trait]
pub trait AlarmPersistence: Send + Sync {
    /// Every well-formed alarm under the namespace. Malformed records are
    /// skipped; only a failure to enumerate keys is an error.
    async fn load_all(&self) -> Result<Vec<AlarmRecord>, PersistenceError>;

    /// Overwrite one key per alarm. A failing record never stops the others.
    async fn save_all(&self, records: &[AlarmRecord]) -> SaveReport;

    /// Best-effort removal; failures are logged.
    async fn remove(&self, id: &AlarmId);
}

pub struct AlarmRepository {
    kv: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl AlarmRepository {
    pub fn new(kv: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> AlarmRepository {
        AlarmRepository {
            kv,
            namespace: namespace.into(),
        }
    }

    fn key(&self, id: &AlarmId) -> String {
        format!("{}{}", self.namespace, id)
    }

    async fn load_one(&self, key: &str) -> Result<Option<AlarmRecord>, PersistenceError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        let snapshot: AlarmSnapshot = serde_json::from_str(&raw)?;
        let record = AlarmRecord::try_from(snapshot).map_err(|source| PersistenceError::Malformed {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(record))
    }
}

#[async_trait]
impl AlarmPersistence for AlarmRepository {
    async fn load_all(&self) -> Result<Vec<AlarmRecord>, PersistenceError> {
        let keys = self.kv.keys_with_prefix(&self.namespace).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.load_one(&key).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("persistence:: skipping '{key}': {e}"),
            }
        }
        debug!("persistence:: loaded {} alarm(s)", records.len());
        Ok(records)
    }

    async fn save_all(&self, records: &[AlarmRecord]) -> SaveReport {
        let mut report = SaveReport::default();
        for record in records {
            let key = self.key(&record.id);
            let result = match serde_json::to_string(&record.snapshot()) {
                Ok(json) => self.kv.set(&key, json).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => report.written += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("persistence:: failed to write '{key}': {e}");
                }
            }
        }
        report
    }

    async fn remove(&self, id: &AlarmId) {
        let key = self.key(id);
        if let Err(e) = self.kv.remove(&key).await {
            warn!("persistence:: error removing '{key}': {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{time_today, TriggerId};

    fn record(id: &str, hour: u32, minute: u32, trigger: Option<&str>) -> AlarmRecord {
        AlarmRecord {
            id: AlarmId::from(id),
            scheduled_time: time_today(hour, minute).unwrap(),
            trigger_id: trigger.map(TriggerId::from),
        }
    }

    #[tokio::test]
    async fn file_store_roundtrip_and_prefix_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();
        store.set("freepray1", "one".into()).await.unwrap();
        store.set("freepray2", "two".into()).await.unwrap();
        store.set("other", "x".into()).await.unwrap();

        assert_eq!(store.keys_with_prefix("freepray").await.unwrap(), vec!["freepray1", "freepray2"]);
        assert_eq!(store.get("freepray2").await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.remove("freepray1").await.unwrap();
        store.remove("freepray1").await.unwrap();
        assert_eq!(store.keys_with_prefix("freepray").await.unwrap(), vec!["freepray2"]);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileKeyValueStore::open(dir.path()).await.unwrap();
            store.set("k/with:odd chars", "v".into()).await.unwrap();
        }
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("k/with:odd chars").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn repository_roundtrip_preserves_fields() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let repo = AlarmRepository::new(kv.clone(), "freepray");
        let records = vec![record("a", 22, 0, Some("t1")), record("b", 6, 0, None)];

        assert_eq!(repo.save_all(&records).await, SaveReport { written: 2, failed: 0 });
        assert!(kv.entries().contains_key("freeprayb"));

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        let a = loaded.iter().find(|r| r.id.as_str() == "a").unwrap();
        assert_eq!((a.hour(), a.minute()), (22, 0));
        assert_eq!(a.trigger_id, Some(TriggerId::from("t1")));
        let b = loaded.iter().find(|r| r.id.as_str() == "b").unwrap();
        assert!(!b.enabled());
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let repo = AlarmRepository::new(kv.clone(), "freepray");
        repo.save_all(&[record("good", 7, 5, Some("t"))]).await;
        kv.set("freepraybroken", "{not json".into()).await.unwrap();
        kv.set("freepraybadtime", r#"{"id":"badtime","time":"yesterday"}"#.into())
            .await
            .unwrap();
        kv.set("unrelated", "{not json".into()).await.unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id.as_str(), "good");
    }

    #[tokio::test]
    async fn one_failing_write_does_not_block_others() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.fail_writes_for("freeprayb");
        let repo = AlarmRepository::new(kv.clone(), "freepray");
        let report = repo
            .save_all(&[record("a", 1, 0, None), record("b", 2, 0, None), record("c", 3, 0, None)])
            .await;
        assert_eq!(report, SaveReport { written: 2, failed: 1 });
        let keys: Vec<_> = kv.entries().into_keys().collect();
        assert_eq!(keys, vec!["freepraya".to_string(), "freeprayc".to_string()]);
    }

    #[tokio::test]
    async fn remove_failure_is_swallowed() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let repo = AlarmRepository::new(kv.clone(), "freepray");
        repo.save_all(&[record("a", 1, 0, None)]).await;
        kv.set_unavailable(true);
        repo.remove(&AlarmId::from("a")).await;
        kv.set_unavailable(false);
        assert!(kv.entries().contains_key("freepraya"));
    }

    #[tokio::test]
    async fn unavailable_store_fails_load() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let repo = AlarmRepository::new(kv.clone(), "freepray");
        kv.set_unavailable(true);
        assert!(repo.load_all().await.is_err());
    }
}
