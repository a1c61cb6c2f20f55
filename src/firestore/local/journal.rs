use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};

/// One durable change to the object stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum JournalOp {
    CreateStore { store: String },
    Put { store: String, key: String, value: Value },
    Delete { store: String, key: String },
    SetVersion { version: u32 },
}

/// A committed transaction. Snapshot entries replace all previous state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    #[serde(default)]
    pub snapshot: bool,
    pub ops: Vec<JournalOp>,
}

/// Append-only JSON lines file backing a [`super::simple_db::SimpleDb`].
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
    entries_since_compaction: usize,
    compaction_threshold: usize,
}

fn io_error(context: &str, path: &Path, err: std::io::Error) -> FirestoreError {
    internal_error(format!("{context} {}: {err}", path.display()))
}

impl FileJournal {
    /// Opens (creating if needed) the journal and returns the entries to replay.
    pub fn open(path: impl Into<PathBuf>, compaction_threshold: usize) -> FirestoreResult<(Self, Vec<JournalEntry>)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| io_error("failed to create journal directory", parent, err))?;
            }
        }

        let mut entries = Vec::new();
        let mut torn_at = None;
        if path.exists() {
            let reader = File::open(&path).map_err(|err| io_error("failed to open journal", &path, err))?;
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            let mut offset = 0u64;
            let mut index = 0usize;
            loop {
                line.clear();
                let read = reader
                    .read_line(&mut line)
                    .map_err(|err| io_error("failed to read journal", &path, err))?;
                if read == 0 {
                    break;
                }
                index += 1;
                if line.trim().is_empty() {
                    offset += read as u64;
                    continue;
                }
                // Only newline-terminated lines were fully written.
                let parsed = if line.ends_with('\n') {
                    serde_json::from_str::<JournalEntry>(&line).map_err(|err| err.to_string())
                } else {
                    Err("missing line terminator".to_string())
                };
                match parsed {
                    Ok(entry) => {
                        entries.push(entry);
                        offset += read as u64;
                    }
                    Err(err) => {
                        log::warn!(
                            "Discarding unreadable journal entry {index} and everything after it in {}: {err}",
                            path.display()
                        );
                        torn_at = Some(offset);
                        break;
                    }
                }
            }
        }

        // Drop the torn tail so later appends start on a fresh line.
        if let Some(offset) = torn_at {
            OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|file| file.set_len(offset).and_then(|_| file.sync_all()))
                .map_err(|err| io_error("failed to truncate journal", &path, err))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| io_error("failed to open journal for append", &path, err))?;
        let entries_since_compaction = entries.iter().rev().take_while(|entry| !entry.snapshot).count();

        Ok((
            Self {
                path,
                file,
                entries_since_compaction,
                compaction_threshold: compaction_threshold.max(1),
            },
            entries,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, ops: &[JournalOp]) -> FirestoreResult<()> {
        let entry = JournalEntry {
            snapshot: false,
            ops: ops.to_vec(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|err| io_error("failed to append to journal", &self.path, err))?;
        self.entries_since_compaction += 1;
        Ok(())
    }

    pub fn needs_compaction(&self) -> bool {
        self.entries_since_compaction >= self.compaction_threshold
    }

    /// Rewrites the journal as a single snapshot entry holding `ops`.
    pub fn compact(&mut self, ops: Vec<JournalOp>) -> FirestoreResult<()> {
        let entry = JournalEntry { snapshot: true, ops };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let tmp_path = self.path.with_extension("compacting");
        fs::write(&tmp_path, line.as_bytes()).map_err(|err| io_error("failed to write journal snapshot", &tmp_path, err))?;
        fs::rename(&tmp_path, &self.path).map_err(|err| io_error("failed to replace journal", &self.path, err))?;
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|err| io_error("failed to reopen journal", &self.path, err))?;
        self.entries_since_compaction = 0;
        log::debug!("Compacted journal {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn temp_journal_path(label: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        std::env::temp_dir().join(format!(
            "firestore-sync-{label}-{}-{}.jsonl",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ))
    }

    #[test]
    fn appends_and_replays_entries() {
        let path = temp_journal_path("journal-replay");
        {
            let (mut journal, entries) = FileJournal::open(&path, 10).unwrap();
            assert!(entries.is_empty());
            journal
                .append(&[JournalOp::Put {
                    store: "s".into(),
                    key: "k".into(),
                    value: json!(1),
                }])
                .unwrap();
        }
        let (_, entries) = FileJournal::open(&path, 10).unwrap();
        assert_eq!(entries.len(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn ignores_torn_trailing_line() {
        let path = temp_journal_path("journal-torn");
        fs::write(&path, "{\"snapshot\":false,\"ops\":[]}\n{\"snapshot\":fal").unwrap();
        let (_, entries) = FileJournal::open(&path, 10).unwrap();
        assert_eq!(entries.len(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn appends_after_a_torn_line_survive_reopen() {
        let path = temp_journal_path("journal-torn-append");
        fs::write(&path, "{\"snapshot\":false,\"ops\":[]}\n{\"snapshot\":fal").unwrap();
        {
            let (mut journal, entries) = FileJournal::open(&path, 10).unwrap();
            assert_eq!(entries.len(), 1);
            journal.append(&[JournalOp::SetVersion { version: 1 }]).unwrap();
            journal.append(&[JournalOp::SetVersion { version: 2 }]).unwrap();
        }

        let (_, entries) = FileJournal::open(&path, 10).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].ops, vec![JournalOp::SetVersion { version: 2 }]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_rewrites_file() {
        let path = temp_journal_path("journal-compact");
        let (mut journal, _) = FileJournal::open(&path, 2).unwrap();
        journal.append(&[JournalOp::SetVersion { version: 1 }]).unwrap();
        journal.append(&[JournalOp::SetVersion { version: 2 }]).unwrap();
        assert!(journal.needs_compaction());
        journal.compact(vec![JournalOp::SetVersion { version: 2 }]).unwrap();
        assert!(!journal.needs_compaction());

        let (_, entries) = FileJournal::open(&path, 2).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].snapshot);
        let _ = fs::remove_file(&path);
    }
}
