use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_channel::Receiver;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::firestore::core::listen_sequence::ListenSequence;
use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::schema::{
    DbOwner, DbTargetGlobal, LocalSchema, GLOBAL_KEY, OWNER_KEY, OWNER_STORE, SCHEMA_VERSION, TARGET_GLOBAL_STORE,
};
use crate::firestore::local::simple_db::{DbChange, DbMode, JournalConfig, SimpleDb, SimpleDbTransaction};
use crate::firestore::model::ListenSequenceNumber;
use crate::firestore::settings::{FirestoreSettings, PersistenceSettings};

const MAX_TRANSACTION_ATTEMPTS: usize = 3;

/// Access mode of a persistence transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, and only allowed while this client holds the primary lease.
    ReadWritePrimary,
}

/// A storage transaction tagged with the listen sequence number it runs at.
pub struct PersistenceTransaction<'a> {
    db: SimpleDbTransaction<'a>,
    sequence_number: ListenSequenceNumber,
}

impl<'a> PersistenceTransaction<'a> {
    /// Sequence number recorded on targets and sentinel rows touched by this transaction.
    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }
}

impl<'a> Deref for PersistenceTransaction<'a> {
    type Target = SimpleDbTransaction<'a>;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl<'a> DerefMut for PersistenceTransaction<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.db
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn is_retryable(error: &FirestoreError) -> bool {
    matches!(error.code, FirestoreErrorCode::Aborted | FirestoreErrorCode::Unavailable)
}

pub fn generate_client_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

/// Owns the object stores and arbitrates the primary lease between clients sharing them.
pub struct Persistence {
    db: Arc<SimpleDb>,
    client_id: String,
    lease_duration: Duration,
    is_primary: AtomicBool,
    listen_sequence: StdMutex<ListenSequence>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("client_id", &self.client_id)
            .field("is_primary", &self.is_primary())
            .finish()
    }
}

impl Persistence {
    /// Opens storage as configured, falling back to memory when the journal is unusable.
    pub fn open(settings: &FirestoreSettings) -> FirestoreResult<Arc<Self>> {
        let name = settings.database_id.to_string();
        let db = match &settings.persistence {
            PersistenceSettings::Memory => SimpleDb::open_in_memory(name, SCHEMA_VERSION, &LocalSchema)?,
            PersistenceSettings::Journal { path } => {
                let journal = JournalConfig {
                    path: path.clone(),
                    compaction_threshold: settings.journal_compaction_threshold,
                };
                match SimpleDb::open(name.clone(), SCHEMA_VERSION, &LocalSchema, Some(journal)) {
                    Ok(db) => db,
                    Err(err) => {
                        log::warn!(
                            "Failed to open persistent cache at {}, falling back to memory: {err}",
                            path.display()
                        );
                        SimpleDb::open_in_memory(name, SCHEMA_VERSION, &LocalSchema)?
                    }
                }
            }
        };
        let client_id = settings.client_id.clone().unwrap_or_else(generate_client_id);
        Ok(Self::with_database(Arc::new(db), client_id, settings.primary_lease_duration))
    }

    /// Attaches to an already open database, possibly shared with other clients.
    pub fn with_database(db: Arc<SimpleDb>, client_id: impl Into<String>, lease_duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            db,
            client_id: client_id.into(),
            lease_duration,
            is_primary: AtomicBool::new(false),
            listen_sequence: StdMutex::new(ListenSequence::new(0)),
        })
    }

    /// Seeds the listen sequence from storage and tries to take the primary lease.
    pub async fn start(&self) -> FirestoreResult<bool> {
        let highest = self
            .db
            .run(&self.client_id, DbMode::ReadOnly, |txn| {
                let global: Option<DbTargetGlobal> = txn.get(TARGET_GLOBAL_STORE, GLOBAL_KEY)?;
                Ok(global.map(|g| g.highest_listen_sequence_number).unwrap_or_default())
            })
            .await?;
        *self.listen_sequence.lock().unwrap() = ListenSequence::new(highest);
        self.refresh_lease().await
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn database(&self) -> &Arc<SimpleDb> {
        &self.db
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Commits made by any client sharing the database.
    pub fn subscribe_changes(&self) -> Receiver<DbChange> {
        self.db.subscribe()
    }

    /// Takes or extends the primary lease when it is free, ours, or expired.
    pub async fn refresh_lease(&self) -> FirestoreResult<bool> {
        let now = now_ms();
        let lease_ms = self.lease_duration.as_millis() as i64;
        let client_id = self.client_id.clone();
        let primary = self
            .db
            .run(&self.client_id, DbMode::ReadWrite, |txn| {
                let owner: Option<DbOwner> = txn.get(OWNER_STORE, OWNER_KEY)?;
                let available = match owner {
                    None => true,
                    Some(owner) => owner.owner_id == client_id || now - owner.lease_timestamp_ms > lease_ms,
                };
                if available {
                    txn.put(
                        OWNER_STORE,
                        OWNER_KEY,
                        &DbOwner {
                            owner_id: client_id.clone(),
                            lease_timestamp_ms: now,
                        },
                    )?;
                }
                Ok(available)
            })
            .await?;
        let was_primary = self.is_primary.swap(primary, Ordering::SeqCst);
        if was_primary != primary {
            log::debug!(
                "Client {} {} the primary lease",
                self.client_id,
                if primary { "acquired" } else { "lost" }
            );
        }
        Ok(primary)
    }

    /// Gives up the primary lease if this client holds it.
    pub async fn release_lease(&self) -> FirestoreResult<()> {
        let client_id = self.client_id.clone();
        self.db
            .run(&self.client_id, DbMode::ReadWrite, |txn| {
                let owner: Option<DbOwner> = txn.get(OWNER_STORE, OWNER_KEY)?;
                if owner.is_some_and(|owner| owner.owner_id == client_id) {
                    txn.delete(OWNER_STORE, OWNER_KEY)?;
                }
                Ok(())
            })
            .await?;
        self.is_primary.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn verify_primary_lease(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let owner: Option<DbOwner> = txn.get(OWNER_STORE, OWNER_KEY)?;
        let lease_ms = self.lease_duration.as_millis() as i64;
        let holds_lease = owner
            .is_some_and(|owner| owner.owner_id == self.client_id && now_ms() - owner.lease_timestamp_ms <= lease_ms);
        if holds_lease {
            Ok(())
        } else {
            self.is_primary.store(false, Ordering::SeqCst);
            Err(failed_precondition(
                "The current client does not hold the primary lease required for this operation",
            ))
        }
    }

    /// Runs `action` atomically, retrying transient storage failures.
    pub async fn run_transaction<T, F>(&self, action: &str, mode: TransactionMode, mut transaction: F) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        let mut attempt = 1;
        loop {
            match self.run_once(mode, &mut transaction).await {
                Err(err) if is_retryable(&err) && attempt < MAX_TRANSACTION_ATTEMPTS => {
                    log::debug!("Transaction '{action}' failed on attempt {attempt}, retrying: {err}");
                    attempt += 1;
                }
                Err(err) => {
                    log::debug!("Transaction '{action}' failed: {err}");
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    async fn run_once<T, F>(&self, mode: TransactionMode, transaction: &mut F) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        let db_mode = match mode {
            TransactionMode::ReadOnly => DbMode::ReadOnly,
            TransactionMode::ReadWrite | TransactionMode::ReadWritePrimary => DbMode::ReadWrite,
        };
        let db = self.db.begin(&self.client_id, db_mode).await;
        let sequence_number = {
            let mut sequence = self.listen_sequence.lock().unwrap();
            match mode {
                TransactionMode::ReadOnly => sequence.current(),
                _ => sequence.next(),
            }
        };
        let mut txn = PersistenceTransaction { db, sequence_number };
        if mode == TransactionMode::ReadWritePrimary {
            self.verify_primary_lease(&txn)?;
        }
        let value = transaction(&mut txn)?;
        txn.db.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::aborted;
    use crate::firestore::model::DatabaseId;

    fn shared_db() -> Arc<SimpleDb> {
        Arc::new(SimpleDb::open_in_memory("shared", SCHEMA_VERSION, &LocalSchema).unwrap())
    }

    #[tokio::test]
    async fn first_client_becomes_primary() {
        let db = shared_db();
        let first = Persistence::with_database(db.clone(), "first", Duration::from_secs(5));
        let second = Persistence::with_database(db, "second", Duration::from_secs(5));
        assert!(first.start().await.unwrap());
        assert!(!second.start().await.unwrap());

        let err = second
            .run_transaction("primary only", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);

        first.release_lease().await.unwrap();
        assert!(second.refresh_lease().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let db = shared_db();
        let first = Persistence::with_database(db.clone(), "first", Duration::from_millis(0));
        let second = Persistence::with_database(db, "second", Duration::from_millis(0));
        assert!(first.start().await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(second.refresh_lease().await.unwrap());
    }

    #[tokio::test]
    async fn retries_aborted_transactions() {
        let persistence = Persistence::with_database(shared_db(), "client", Duration::from_secs(5));
        let mut calls = 0;
        let value = persistence
            .run_transaction("flaky", TransactionMode::ReadWrite, |_| {
                calls += 1;
                if calls < 3 {
                    Err(aborted("contention"))
                } else {
                    Ok(calls)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);

        let mut failing_calls = 0;
        let result: FirestoreResult<()> = persistence
            .run_transaction("always aborts", TransactionMode::ReadWrite, |_| {
                failing_calls += 1;
                Err(aborted("contention"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(failing_calls, MAX_TRANSACTION_ATTEMPTS);
    }

    #[tokio::test]
    async fn read_write_transactions_advance_sequence_numbers() {
        let persistence = Persistence::with_database(shared_db(), "client", Duration::from_secs(5));
        persistence.start().await.unwrap();
        let first = persistence
            .run_transaction("a", TransactionMode::ReadWrite, |txn| Ok(txn.current_sequence_number()))
            .await
            .unwrap();
        let second = persistence
            .run_transaction("b", TransactionMode::ReadWrite, |txn| Ok(txn.current_sequence_number()))
            .await
            .unwrap();
        let read = persistence
            .run_transaction("c", TransactionMode::ReadOnly, |txn| Ok(txn.current_sequence_number()))
            .await
            .unwrap();
        assert!(second > first);
        assert_eq!(read, second);
    }

    #[test]
    fn unusable_journal_falls_back_to_memory() {
        let dir = std::env::temp_dir().join(format!("firestore-sync-not-a-file-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = FirestoreSettings::new(DatabaseId::default("project"))
            .with_persistence(PersistenceSettings::Journal { path: dir.clone() });
        let persistence = Persistence::open(&settings).unwrap();
        assert!(!persistence.client_id().is_empty());
        let _ = std::fs::remove_dir(&dir);
    }
}
