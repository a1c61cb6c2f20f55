use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use async_channel::{Receiver, Sender};
use async_lock::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::firestore::error::{failed_precondition, internal_error, FirestoreResult};
use crate::firestore::local::journal::{FileJournal, JournalOp};

/// Access mode of a [`SimpleDbTransaction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbMode {
    ReadOnly,
    ReadWrite,
}

/// A contiguous range of keys within one object store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<String>,
    upper: Bound<String>,
    prefix: Option<String>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            prefix: None,
        }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            lower: Bound::Included(prefix.clone()),
            upper: Bound::Unbounded,
            prefix: Some(prefix),
        }
    }

    pub fn bounded(lower: Bound<String>, upper: Bound<String>) -> Self {
        Self {
            lower,
            upper,
            prefix: None,
        }
    }

    /// Keys starting with `prefix` that sort strictly after `after`.
    pub fn prefix_after(prefix: impl Into<String>, after: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            lower: Bound::Excluded(after.into()),
            upper: Bound::Unbounded,
            prefix: Some(prefix),
        }
    }

    fn bounds(&self) -> (Bound<&str>, Bound<&str>) {
        (as_str_bound(&self.lower), as_str_bound(&self.upper))
    }

    fn is_degenerate(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(lower), Bound::Included(upper)) => lower > upper,
            (Bound::Included(lower), Bound::Excluded(upper))
            | (Bound::Excluded(lower), Bound::Included(upper))
            | (Bound::Excluded(lower), Bound::Excluded(upper)) => lower >= upper,
            _ => false,
        }
    }

    fn within_prefix(&self, key: &str) -> bool {
        self.prefix.as_deref().map_or(true, |prefix| key.starts_with(prefix))
    }

    fn contains(&self, key: &str) -> bool {
        let above = match &self.lower {
            Bound::Included(lower) => key >= lower.as_str(),
            Bound::Excluded(lower) => key > lower.as_str(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(upper) => key <= upper.as_str(),
            Bound::Excluded(upper) => key < upper.as_str(),
            Bound::Unbounded => true,
        };
        above && below && self.within_prefix(key)
    }
}

fn as_str_bound(bound: &Bound<String>) -> Bound<&str> {
    match bound {
        Bound::Included(value) => Bound::Included(value.as_str()),
        Bound::Excluded(value) => Bound::Excluded(value.as_str()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// A record written or deleted by a committed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedRecord {
    pub store: String,
    pub key: String,
}

/// Notification published after every committed read-write transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbChange {
    /// Identifier of the client that committed the transaction.
    pub origin: String,
    pub records: Vec<ChangedRecord>,
}

/// Creates and migrates object stores when a database is opened at a newer version.
pub trait SchemaConverter: Send + Sync {
    fn create_or_upgrade(&self, txn: &mut SimpleDbTransaction<'_>, from_version: u32, to_version: u32) -> FirestoreResult<()>;
}

/// Durable backing for a [`SimpleDb`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalConfig {
    pub path: PathBuf,
    pub compaction_threshold: usize,
}

#[derive(Debug, Default)]
struct DbState {
    stores: BTreeMap<String, BTreeMap<String, Value>>,
    version: u32,
    journal: Option<FileJournal>,
}

impl DbState {
    fn apply(&mut self, op: JournalOp, changed: &mut Vec<ChangedRecord>) {
        match op {
            JournalOp::CreateStore { store } => {
                self.stores.entry(store).or_default();
            }
            JournalOp::Put { store, key, value } => {
                self.stores.entry(store.clone()).or_default().insert(key.clone(), value);
                changed.push(ChangedRecord { store, key });
            }
            JournalOp::Delete { store, key } => {
                if let Some(records) = self.stores.get_mut(&store) {
                    records.remove(&key);
                }
                changed.push(ChangedRecord { store, key });
            }
            JournalOp::SetVersion { version } => self.version = version,
        }
    }

    fn snapshot_ops(&self) -> Vec<JournalOp> {
        let mut ops = vec![JournalOp::SetVersion { version: self.version }];
        for (store, records) in &self.stores {
            ops.push(JournalOp::CreateStore { store: store.clone() });
            for (key, value) in records {
                ops.push(JournalOp::Put {
                    store: store.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        ops
    }

    fn commit(&mut self, ops: Vec<JournalOp>) -> FirestoreResult<Vec<ChangedRecord>> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&ops)?;
        }
        let mut changed = Vec::new();
        for op in ops {
            self.apply(op, &mut changed);
        }
        if self.journal.as_ref().is_some_and(FileJournal::needs_compaction) {
            let snapshot = self.snapshot_ops();
            if let Some(journal) = self.journal.as_mut() {
                if let Err(err) = journal.compact(snapshot) {
                    log::warn!("Journal compaction failed, continuing with the uncompacted journal: {err}");
                }
            }
        }
        Ok(changed)
    }
}

/// Versioned collection of ordered object stores with all-or-nothing transactions.
///
/// Records are JSON values addressed by string keys. Writes are buffered in the
/// transaction and become visible (and durable, when a journal is configured) on
/// [`SimpleDbTransaction::commit`]. Dropping a transaction aborts it.
pub struct SimpleDb {
    name: String,
    state: Mutex<DbState>,
    observers: StdMutex<Vec<Sender<DbChange>>>,
}

impl std::fmt::Debug for SimpleDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleDb").field("name", &self.name).finish()
    }
}

impl SimpleDb {
    /// Opens the database, replaying `journal` when given, and upgrades it to `version`.
    pub fn open(
        name: impl Into<String>,
        version: u32,
        converter: &dyn SchemaConverter,
        journal: Option<JournalConfig>,
    ) -> FirestoreResult<Self> {
        let name = name.into();
        let mut state = DbState::default();
        if let Some(config) = journal {
            let (journal, entries) = FileJournal::open(config.path, config.compaction_threshold)?;
            let mut ignored = Vec::new();
            for entry in entries {
                if entry.snapshot {
                    state.stores.clear();
                    state.version = 0;
                }
                for op in entry.ops {
                    state.apply(op, &mut ignored);
                }
            }
            log::debug!(
                "Replayed journal {} into {} object stores at version {}",
                journal.path().display(),
                state.stores.len(),
                state.version
            );
            state.journal = Some(journal);
        }

        if state.version > version {
            return Err(failed_precondition(format!(
                "database {name} has schema version {} which is newer than the supported version {version}",
                state.version
            )));
        }

        let db = Self {
            name,
            state: Mutex::new(state),
            observers: StdMutex::new(Vec::new()),
        };

        let from_version = db.try_state()?.version;
        if from_version < version {
            log::debug!("Upgrading database {} from version {from_version} to {version}", db.name);
            let mut txn = SimpleDbTransaction::new(&db, db.try_state()?, "", DbMode::ReadWrite, true);
            converter.create_or_upgrade(&mut txn, from_version, version)?;
            txn.ops.push(JournalOp::SetVersion { version });
            txn.commit()?;
        }
        Ok(db)
    }

    pub fn open_in_memory(name: impl Into<String>, version: u32, converter: &dyn SchemaConverter) -> FirestoreResult<Self> {
        Self::open(name, version, converter, None)
    }

    fn try_state(&self) -> FirestoreResult<MutexGuard<'_, DbState>> {
        self.state
            .try_lock()
            .ok_or_else(|| internal_error(format!("database {} is busy while opening", self.name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn version(&self) -> u32 {
        self.state.lock().await.version
    }

    /// Starts a transaction. It holds exclusive access until committed or dropped.
    pub async fn begin(&self, origin: &str, mode: DbMode) -> SimpleDbTransaction<'_> {
        let state = self.state.lock().await;
        SimpleDbTransaction::new(self, state, origin, mode, false)
    }

    /// Runs `action` in a transaction, committing when it returns `Ok`.
    pub async fn run<T, F>(&self, origin: &str, mode: DbMode, action: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut SimpleDbTransaction<'_>) -> FirestoreResult<T>,
    {
        let mut txn = self.begin(origin, mode).await;
        let value = action(&mut txn)?;
        txn.commit()?;
        Ok(value)
    }

    /// Receives a [`DbChange`] for every committed transaction from any client.
    pub fn subscribe(&self) -> Receiver<DbChange> {
        let (sender, receiver) = async_channel::unbounded();
        self.observers.lock().unwrap().push(sender);
        receiver
    }

    fn notify(&self, change: DbChange) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|sender| sender.try_send(change.clone()).is_ok());
    }
}

/// Exclusive view over a [`SimpleDb`] with buffered writes.
pub struct SimpleDbTransaction<'a> {
    db: &'a SimpleDb,
    state: MutexGuard<'a, DbState>,
    origin: String,
    mode: DbMode,
    version_change: bool,
    ops: Vec<JournalOp>,
    pending: BTreeMap<String, BTreeMap<String, Option<Value>>>,
    created_stores: BTreeSet<String>,
}

impl<'a> SimpleDbTransaction<'a> {
    fn new(db: &'a SimpleDb, state: MutexGuard<'a, DbState>, origin: &str, mode: DbMode, version_change: bool) -> Self {
        Self {
            db,
            state,
            origin: origin.to_string(),
            mode,
            version_change,
            ops: Vec::new(),
            pending: BTreeMap::new(),
            created_stores: BTreeSet::new(),
        }
    }

    pub fn mode(&self) -> DbMode {
        self.mode
    }

    /// Object-store creation is only allowed while upgrading the schema.
    pub fn create_object_store(&mut self, store: &str) -> FirestoreResult<()> {
        if !self.version_change {
            return Err(internal_error(format!(
                "object store {store} can only be created during a schema upgrade"
            )));
        }
        if self.has_store(store) {
            return Ok(());
        }
        self.created_stores.insert(store.to_string());
        self.ops.push(JournalOp::CreateStore {
            store: store.to_string(),
        });
        Ok(())
    }

    pub fn has_store(&self, store: &str) -> bool {
        self.state.stores.contains_key(store) || self.created_stores.contains(store)
    }

    fn check_store(&self, store: &str) -> FirestoreResult<()> {
        if self.has_store(store) {
            Ok(())
        } else {
            Err(internal_error(format!("unknown object store {store}")))
        }
    }

    fn check_writable(&self, store: &str) -> FirestoreResult<()> {
        self.check_store(store)?;
        if self.mode == DbMode::ReadOnly {
            return Err(internal_error(format!(
                "cannot write to {store} in a read-only transaction"
            )));
        }
        Ok(())
    }

    fn raw_get(&self, store: &str, key: &str) -> Option<&Value> {
        if let Some(pending) = self.pending.get(store).and_then(|records| records.get(key)) {
            return pending.as_ref();
        }
        self.state.stores.get(store).and_then(|records| records.get(key))
    }

    pub fn get<T: DeserializeOwned>(&self, store: &str, key: &str) -> FirestoreResult<Option<T>> {
        self.check_store(store)?;
        match self.raw_get(store, key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, store: &str, key: &str) -> FirestoreResult<bool> {
        self.check_store(store)?;
        Ok(self.raw_get(store, key).is_some())
    }

    pub fn put<T: Serialize + ?Sized>(&mut self, store: &str, key: impl Into<String>, value: &T) -> FirestoreResult<()> {
        self.check_writable(store)?;
        let key = key.into();
        let value = serde_json::to_value(value)?;
        self.pending
            .entry(store.to_string())
            .or_default()
            .insert(key.clone(), Some(value.clone()));
        self.ops.push(JournalOp::Put {
            store: store.to_string(),
            key,
            value,
        });
        Ok(())
    }

    pub fn delete(&mut self, store: &str, key: impl Into<String>) -> FirestoreResult<()> {
        self.check_writable(store)?;
        let key = key.into();
        self.pending.entry(store.to_string()).or_default().insert(key.clone(), None);
        self.ops.push(JournalOp::Delete {
            store: store.to_string(),
            key,
        });
        Ok(())
    }

    /// Deletes every key in `range`, returning how many records were removed.
    pub fn delete_range(&mut self, store: &str, range: &KeyRange) -> FirestoreResult<usize> {
        let keys = self.scan_keys(store, range)?;
        for key in &keys {
            self.delete(store, key.clone())?;
        }
        Ok(keys.len())
    }

    fn merged(&self, store: &str, range: &KeyRange) -> BTreeMap<&str, &Value> {
        let mut merged = BTreeMap::new();
        if range.is_degenerate() {
            return merged;
        }
        if let Some(records) = self.state.stores.get(store) {
            for (key, value) in records
                .range::<str, _>(range.bounds())
                .take_while(|(key, _)| range.within_prefix(key))
            {
                merged.insert(key.as_str(), value);
            }
        }
        if let Some(pending) = self.pending.get(store) {
            for (key, value) in pending.iter().filter(|(key, _)| range.contains(key)) {
                match value {
                    Some(value) => {
                        merged.insert(key.as_str(), value);
                    }
                    None => {
                        merged.remove(key.as_str());
                    }
                }
            }
        }
        merged
    }

    /// Records in `range` in ascending key order.
    pub fn scan<T: DeserializeOwned>(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<(String, T)>> {
        self.check_store(store)?;
        self.merged(store, range)
            .into_iter()
            .map(|(key, value)| Ok((key.to_string(), serde_json::from_value(value.clone())?)))
            .collect()
    }

    pub fn scan_keys(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<String>> {
        self.check_store(store)?;
        Ok(self.merged(store, range).into_keys().map(str::to_string).collect())
    }

    pub fn count(&self, store: &str, range: &KeyRange) -> FirestoreResult<usize> {
        self.check_store(store)?;
        Ok(self.merged(store, range).len())
    }

    /// Applies the buffered writes atomically and notifies subscribers.
    pub fn commit(mut self) -> FirestoreResult<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.ops);
        let records = self.state.commit(ops)?;
        let db = self.db;
        let origin = std::mem::take(&mut self.origin);
        drop(self);
        if !records.is_empty() {
            db.notify(DbChange { origin, records });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct Stores(pub Vec<&'static str>);

    impl SchemaConverter for Stores {
        fn create_or_upgrade(&self, txn: &mut SimpleDbTransaction<'_>, _from: u32, _to: u32) -> FirestoreResult<()> {
            for store in &self.0 {
                txn.create_object_store(store)?;
            }
            Ok(())
        }
    }

    fn temp_path(label: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        std::env::temp_dir().join(format!(
            "firestore-sync-{label}-{}-{}.jsonl",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ))
    }

    fn memory_db() -> SimpleDb {
        SimpleDb::open_in_memory("test", 1, &Stores(vec!["items"])).unwrap()
    }

    #[tokio::test]
    async fn committed_writes_are_visible() {
        let db = memory_db();
        db.run("a", DbMode::ReadWrite, |txn| txn.put("items", "k1", &json!({"v": 1})))
            .await
            .unwrap();
        let value: Option<Value> = db.run("a", DbMode::ReadOnly, |txn| txn.get("items", "k1")).await.unwrap();
        assert_eq!(value, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn failed_transaction_discards_writes() {
        let db = memory_db();
        let result: FirestoreResult<()> = db
            .run("a", DbMode::ReadWrite, |txn| {
                txn.put("items", "k1", &json!(1))?;
                Err(internal_error("boom"))
            })
            .await;
        assert!(result.is_err());
        let count = db
            .run("a", DbMode::ReadOnly, |txn| txn.count("items", &KeyRange::all()))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn read_only_transactions_reject_writes() {
        let db = memory_db();
        let err = db
            .run("a", DbMode::ReadOnly, |txn| txn.put("items", "k", &json!(1)))
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[tokio::test]
    async fn scans_merge_pending_writes_in_key_order() {
        let db = memory_db();
        db.run("a", DbMode::ReadWrite, |txn| {
            txn.put("items", "p/a", &json!(1))?;
            txn.put("items", "p/c", &json!(3))?;
            txn.put("items", "q/a", &json!(9))
        })
        .await
        .unwrap();

        let keys = db
            .run("a", DbMode::ReadWrite, |txn| {
                txn.put("items", "p/b", &json!(2))?;
                txn.delete("items", "p/c")?;
                txn.scan_keys("items", &KeyRange::prefix("p/"))
            })
            .await
            .unwrap();
        assert_eq!(keys, vec!["p/a".to_string(), "p/b".to_string()]);

        let after = db
            .run("a", DbMode::ReadOnly, |txn| txn.scan::<Value>("items", &KeyRange::prefix_after("p/", "p/a")))
            .await
            .unwrap();
        assert_eq!(after, vec![("p/b".to_string(), json!(2))]);
    }

    #[tokio::test]
    async fn unknown_store_is_an_error() {
        let db = memory_db();
        let err = db
            .run("a", DbMode::ReadOnly, |txn| txn.get::<Value>("missing", "k"))
            .await
            .unwrap_err();
        assert!(err.message().contains("missing"));
    }

    #[tokio::test]
    async fn subscribers_receive_committed_changes() {
        let db = memory_db();
        let changes = db.subscribe();
        db.run("client-1", DbMode::ReadWrite, |txn| txn.put("items", "k", &json!(true)))
            .await
            .unwrap();
        let change = changes.try_recv().unwrap();
        assert_eq!(change.origin, "client-1");
        assert_eq!(change.records[0].key, "k");
    }

    #[tokio::test]
    async fn journal_survives_reopen_and_upgrade() {
        let path = temp_path("simple-db");
        let config = JournalConfig {
            path: path.clone(),
            compaction_threshold: 2,
        };
        {
            let db = SimpleDb::open("test", 1, &Stores(vec!["items"]), Some(config.clone())).unwrap();
            for i in 0..3 {
                db.run("a", DbMode::ReadWrite, |txn| txn.put("items", format!("k{i}"), &json!(i)))
                    .await
                    .unwrap();
            }
        }
        let db = SimpleDb::open("test", 2, &Stores(vec!["items", "extra"]), Some(config)).unwrap();
        assert_eq!(db.version().await, 2);
        let count = db
            .run("a", DbMode::ReadOnly, |txn| {
                assert!(txn.has_store("extra"));
                txn.count("items", &KeyRange::all())
            })
            .await
            .unwrap();
        assert_eq!(count, 3);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn refuses_to_downgrade() {
        let path = temp_path("simple-db-downgrade");
        let config = JournalConfig {
            path: path.clone(),
            compaction_threshold: 10,
        };
        SimpleDb::open("test", 3, &Stores(vec![]), Some(config.clone())).unwrap();
        let err = SimpleDb::open("test", 2, &Stores(vec![]), Some(config)).unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
        let _ = std::fs::remove_file(&path);
    }
}
