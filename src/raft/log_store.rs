//! Durable Raft log on `redb`.
//!
//! Entries are JSON under their index in `raft_log`; the vote, the committed id and
//! the last purged id live in `raft_meta`. Every call is one short transaction.

use std::fs;
use std::ops::RangeBounds;
use std::path::Path;

use anyerror::AnyError;
use openraft::storage::LogState;
use openraft::{Entry, ErrorSubject, ErrorVerb, LogId, StorageError, StorageIOError, Vote};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::types::{NodeId, TypeConfig};

const LOGS: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

const VOTE: &str = "vote";
const COMMITTED: &str = "committed";
const LAST_PURGED: &str = "last_purged";

/// Result of a Raft storage call.
pub type StoreResult<T> = Result<T, StorageError<NodeId>>;

/// Tags a foreign error with the Raft storage subject it concerns.
pub(crate) trait RaftContext<T> {
    fn on(self, subject: ErrorSubject<NodeId>, verb: ErrorVerb) -> StoreResult<T>;
}

impl<T, E: std::error::Error + 'static> RaftContext<T> for Result<T, E> {
    fn on(self, subject: ErrorSubject<NodeId>, verb: ErrorVerb) -> StoreResult<T> {
        self.map_err(|err| StorageError::IO {
            source: StorageIOError::new(subject, verb, AnyError::new(&err)),
        })
    }
}

/// Persistent log, vote and commit marker.
pub struct LogStore {
    db: Database,
}

impl LogStore {
    /// Opens or creates the log database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).on(ErrorSubject::Store, ErrorVerb::Write)?;
        }
        let db = Database::create(path).on(ErrorSubject::Store, ErrorVerb::Write)?;
        let txn = db.begin_write().on(ErrorSubject::Store, ErrorVerb::Write)?;
        txn.open_table(LOGS).on(ErrorSubject::Logs, ErrorVerb::Write)?;
        txn.open_table(META).on(ErrorSubject::Store, ErrorVerb::Write)?;
        txn.commit().on(ErrorSubject::Store, ErrorVerb::Write)?;
        debug!(path = %path.display(), "raft.log.open");
        Ok(Self { db })
    }

    /// Last purged and last present log ids.
    pub fn log_state(&self) -> StoreResult<LogState<TypeConfig>> {
        let last_purged_log_id: Option<LogId<NodeId>> = self.get_meta(LAST_PURGED, ErrorSubject::Logs)?;
        let txn = self.db.begin_read().on(ErrorSubject::Logs, ErrorVerb::Read)?;
        let table = txn.open_table(LOGS).on(ErrorSubject::Logs, ErrorVerb::Read)?;
        let last = match table.last().on(ErrorSubject::Logs, ErrorVerb::Read)? {
            Some((_, value)) => Some(decode_entry(value.value())?.log_id),
            None => None,
        };
        Ok(LogState {
            last_purged_log_id,
            last_log_id: last.or(last_purged_log_id),
        })
    }

    /// Entries whose index falls in `range`, in index order.
    pub fn entries<RB: RangeBounds<u64>>(&self, range: RB) -> StoreResult<Vec<Entry<TypeConfig>>> {
        let txn = self.db.begin_read().on(ErrorSubject::Logs, ErrorVerb::Read)?;
        let table = txn.open_table(LOGS).on(ErrorSubject::Logs, ErrorVerb::Read)?;
        let mut entries = Vec::new();
        for item in table.range(range).on(ErrorSubject::Logs, ErrorVerb::Read)? {
            let (_, value) = item.on(ErrorSubject::Logs, ErrorVerb::Read)?;
            entries.push(decode_entry(value.value())?);
        }
        Ok(entries)
    }

    /// Appends entries in one transaction.
    pub fn append<I>(&self, entries: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = Entry<TypeConfig>>,
    {
        let txn = self.db.begin_write().on(ErrorSubject::Logs, ErrorVerb::Write)?;
        {
            let mut table = txn.open_table(LOGS).on(ErrorSubject::Logs, ErrorVerb::Write)?;
            for entry in entries {
                let bytes = serde_json::to_vec(&entry).on(ErrorSubject::Logs, ErrorVerb::Write)?;
                table
                    .insert(entry.log_id.index, bytes.as_slice())
                    .on(ErrorSubject::Logs, ErrorVerb::Write)?;
            }
        }
        txn.commit().on(ErrorSubject::Logs, ErrorVerb::Write)
    }

    /// Removes `log_id` and every later entry.
    pub fn truncate(&self, log_id: LogId<NodeId>) -> StoreResult<()> {
        self.remove_range(log_id.index..)?;
        debug!(since = log_id.index, "raft.log.truncate");
        Ok(())
    }

    /// Removes every entry up to and including `log_id`.
    pub fn purge(&self, log_id: LogId<NodeId>) -> StoreResult<()> {
        self.put_meta(LAST_PURGED, &log_id, ErrorSubject::Logs)?;
        self.remove_range(..=log_id.index)?;
        debug!(upto = log_id.index, "raft.log.purge");
        Ok(())
    }

    fn remove_range<RB: RangeBounds<u64>>(&self, range: RB) -> StoreResult<()> {
        let txn = self.db.begin_write().on(ErrorSubject::Logs, ErrorVerb::Delete)?;
        {
            let mut table = txn.open_table(LOGS).on(ErrorSubject::Logs, ErrorVerb::Delete)?;
            let mut doomed = Vec::new();
            for item in table.range(range).on(ErrorSubject::Logs, ErrorVerb::Delete)? {
                let (key, _) = item.on(ErrorSubject::Logs, ErrorVerb::Delete)?;
                doomed.push(key.value());
            }
            for index in doomed {
                table.remove(index).on(ErrorSubject::Logs, ErrorVerb::Delete)?;
            }
        }
        txn.commit().on(ErrorSubject::Logs, ErrorVerb::Delete)
    }

    /// Persists the vote before it is acted on.
    pub fn save_vote(&self, vote: &Vote<NodeId>) -> StoreResult<()> {
        self.put_meta(VOTE, vote, ErrorSubject::Vote)
    }

    /// Last saved vote.
    pub fn read_vote(&self) -> StoreResult<Option<Vote<NodeId>>> {
        self.get_meta(VOTE, ErrorSubject::Vote)
    }

    /// Records the highest known committed log id.
    pub fn save_committed(&self, committed: Option<LogId<NodeId>>) -> StoreResult<()> {
        self.put_meta(COMMITTED, &committed, ErrorSubject::Store)
    }

    /// Committed log id saved by [`LogStore::save_committed`].
    pub fn read_committed(&self) -> StoreResult<Option<LogId<NodeId>>> {
        Ok(self
            .get_meta::<Option<LogId<NodeId>>>(COMMITTED, ErrorSubject::Store)?
            .flatten())
    }

    fn put_meta<T: Serialize>(&self, key: &str, value: &T, subject: ErrorSubject<NodeId>) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).on(subject.clone(), ErrorVerb::Write)?;
        let txn = self.db.begin_write().on(subject.clone(), ErrorVerb::Write)?;
        {
            let mut table = txn.open_table(META).on(subject.clone(), ErrorVerb::Write)?;
            table.insert(key, bytes.as_slice()).on(subject.clone(), ErrorVerb::Write)?;
        }
        txn.commit().on(subject, ErrorVerb::Write)
    }

    fn get_meta<T: DeserializeOwned>(&self, key: &str, subject: ErrorSubject<NodeId>) -> StoreResult<Option<T>> {
        let txn = self.db.begin_read().on(subject.clone(), ErrorVerb::Read)?;
        let table = txn.open_table(META).on(subject.clone(), ErrorVerb::Read)?;
        match table.get(key).on(subject.clone(), ErrorVerb::Read)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value()).on(subject, ErrorVerb::Read)?)),
            None => Ok(None),
        }
    }
}

fn decode_entry(bytes: &[u8]) -> StoreResult<Entry<TypeConfig>> {
    serde_json::from_slice(bytes).on(ErrorSubject::Logs, ErrorVerb::Read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::RaftRequest;
    use openraft::{CommittedLeaderId, EntryPayload};

    fn entry(index: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(RaftRequest::new(vec![index as u8])),
        }
    }

    #[test]
    fn append_read_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(&dir.path().join("log.redb")).unwrap();
        store.append((1..=5).map(entry)).unwrap();

        let middle = store.entries(2..4).unwrap();
        assert_eq!(middle.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![2, 3]);

        store.truncate(entry(4).log_id).unwrap();
        let state = store.log_state().unwrap();
        assert_eq!(state.last_log_id.map(|id| id.index), Some(3));
    }

    #[test]
    fn purge_keeps_last_purged_as_tail_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(&dir.path().join("log.redb")).unwrap();
        store.append((1..=3).map(entry)).unwrap();
        store.purge(entry(3).log_id).unwrap();

        let state = store.log_state().unwrap();
        assert_eq!(state.last_purged_log_id.map(|id| id.index), Some(3));
        assert_eq!(state.last_log_id.map(|id| id.index), Some(3));
        assert!(store.entries(..).unwrap().is_empty());
    }

    #[test]
    fn vote_and_commit_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.redb");
        {
            let store = LogStore::open(&path).unwrap();
            store.save_vote(&Vote::new(3, 7)).unwrap();
            store.save_committed(Some(entry(9).log_id)).unwrap();
        }
        let store = LogStore::open(&path).unwrap();
        assert_eq!(store.read_vote().unwrap(), Some(Vote::new(3, 7)));
        assert_eq!(store.read_committed().unwrap().map(|id| id.index), Some(9));
    }
}
