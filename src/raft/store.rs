//! openraft storage over [`LogStore`] and the graph state machine.

use std::fmt::Debug;
use std::fs;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, RaftStorage, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, SnapshotMeta,
    StorageError, StoredMembership, Vote,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::log_store::{LogStore, RaftContext, StoreResult};
use super::types::{NodeId, RaftResponse, TypeConfig};
use crate::fsm::{GraphFsm, GraphSnapshot};
use crate::graph::Graph;

const LOG_FILE: &str = "log.redb";
const SNAPSHOT_FILE: &str = "snapshot.bin";

#[derive(Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
}

impl StoredSnapshot {
    fn to_snapshot(&self) -> Snapshot<TypeConfig> {
        Snapshot {
            meta: self.meta.clone(),
            snapshot: Box::new(Cursor::new(self.data.clone())),
        }
    }
}

/// Applies committed entries to the graph and owns the latest snapshot.
pub struct StateMachine {
    fsm: GraphFsm,
    last_applied: RwLock<Option<LogId<NodeId>>>,
    membership: RwLock<StoredMembership<NodeId, BasicNode>>,
    current: RwLock<Option<StoredSnapshot>>,
    snapshot_path: PathBuf,
    snapshot_idx: AtomicU64,
}

impl StateMachine {
    fn open(graph: Arc<dyn Graph>, snapshot_path: PathBuf) -> StoreResult<Self> {
        let machine = Self {
            fsm: GraphFsm::new(graph),
            last_applied: RwLock::new(None),
            membership: RwLock::new(StoredMembership::default()),
            current: RwLock::new(None),
            snapshot_path,
            snapshot_idx: AtomicU64::new(0),
        };
        // The graph is derived from the log: rewind it to the snapshot (or empty) and
        // let openraft replay the committed tail. Whatever the graph area held before
        // start is discarded, so recovery always goes through the raft directory.
        match read_snapshot_file(&machine.snapshot_path)? {
            Some(stored) => {
                machine.load(&stored)?;
                info!(
                    last_log_id = ?stored.meta.last_log_id,
                    snapshot_id = %stored.meta.snapshot_id,
                    "raft.snapshot.loaded"
                );
                *machine.current.write() = Some(stored);
            }
            None => machine
                .fsm
                .graph()
                .clear()
                .on(ErrorSubject::StateMachine, ErrorVerb::Write)?,
        }
        Ok(machine)
    }

    /// The replicated state machine.
    pub fn fsm(&self) -> &GraphFsm {
        &self.fsm
    }

    /// Last log id reflected in the graph.
    pub fn last_applied(&self) -> Option<LogId<NodeId>> {
        *self.last_applied.read()
    }

    fn load(&self, stored: &StoredSnapshot) -> StoreResult<()> {
        let snapshot = GraphSnapshot::from_bytes(&stored.data)
            .on(ErrorSubject::Snapshot(None), ErrorVerb::Read)?;
        self.fsm
            .restore(&snapshot)
            .on(ErrorSubject::StateMachine, ErrorVerb::Write)?;
        *self.last_applied.write() = stored.meta.last_log_id;
        *self.membership.write() = stored.meta.last_membership.clone();
        Ok(())
    }

    fn apply(&self, entries: &[Entry<TypeConfig>]) -> StoreResult<Vec<RaftResponse>> {
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            let index = entry.log_id.index;
            let response = match &entry.payload {
                EntryPayload::Blank => RaftResponse::empty(index),
                EntryPayload::Membership(membership) => {
                    *self.membership.write() = StoredMembership::new(Some(entry.log_id), membership.clone());
                    RaftResponse::empty(index)
                }
                EntryPayload::Normal(request) => match self.fsm.apply(&request.command) {
                    Ok(applied) => RaftResponse {
                        applied_index: index,
                        outcome: Some(Ok(applied)),
                    },
                    Err(err) if err.is_fatal() => {
                        error!(index, error = %err, "raft.apply.halted");
                        return Err(err).on(ErrorSubject::Apply(entry.log_id), ErrorVerb::Write);
                    }
                    Err(err) => RaftResponse {
                        applied_index: index,
                        outcome: Some(Err(err.to_failure())),
                    },
                },
            };
            *self.last_applied.write() = Some(entry.log_id);
            responses.push(response);
        }
        Ok(responses)
    }

    fn build_snapshot(&self) -> StoreResult<Snapshot<TypeConfig>> {
        let image = self
            .fsm
            .snapshot()
            .on(ErrorSubject::StateMachine, ErrorVerb::Read)?;
        let data = image
            .to_bytes()
            .on(ErrorSubject::Snapshot(None), ErrorVerb::Write)?;
        let last_log_id = self.last_applied();
        let idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = match last_log_id {
            Some(id) => format!("{}-{}-{idx}", id.leader_id.term, id.index),
            None => format!("--{idx}"),
        };
        let stored = StoredSnapshot {
            meta: SnapshotMeta {
                last_log_id,
                last_membership: self.membership.read().clone(),
                snapshot_id,
            },
            data,
        };
        write_snapshot_file(&self.snapshot_path, &stored)?;
        info!(
            snapshot_id = %stored.meta.snapshot_id,
            nodes = image.nodes.len(),
            relationships = image.relationships.len(),
            "raft.snapshot.built"
        );
        let snapshot = stored.to_snapshot();
        *self.current.write() = Some(stored);
        Ok(snapshot)
    }

    fn install(&self, meta: &SnapshotMeta<NodeId, BasicNode>, data: Vec<u8>) -> StoreResult<()> {
        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        self.load(&stored)?;
        write_snapshot_file(&self.snapshot_path, &stored)?;
        info!(snapshot_id = %meta.snapshot_id, "raft.snapshot.installed");
        *self.current.write() = Some(stored);
        Ok(())
    }
}

// Layout: crc32 of the body (big endian) followed by the JSON body.
fn write_snapshot_file(path: &Path, stored: &StoredSnapshot) -> StoreResult<()> {
    let subject = || ErrorSubject::Snapshot(Some(stored.meta.signature()));
    let body = serde_json::to_vec(stored).on(subject(), ErrorVerb::Write)?;
    let mut bytes = Vec::with_capacity(body.len() + 4);
    bytes.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    bytes.extend_from_slice(&body);
    let staging = path.with_extension("tmp");
    fs::write(&staging, &bytes).on(subject(), ErrorVerb::Write)?;
    fs::rename(&staging, path).on(subject(), ErrorVerb::Write)
}

fn read_snapshot_file(path: &Path) -> StoreResult<Option<StoredSnapshot>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).on(ErrorSubject::Snapshot(None), ErrorVerb::Read),
    };
    if bytes.len() < 4 {
        warn!(path = %path.display(), "raft.snapshot.truncated");
        return Ok(None);
    }
    let (checksum, body) = bytes.split_at(4);
    let expected = u32::from_be_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
    if crc32fast::hash(body) != expected {
        let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "snapshot checksum mismatch");
        return Err(err).on(ErrorSubject::Snapshot(None), ErrorVerb::Read);
    }
    serde_json::from_slice(body)
        .map(Some)
        .on(ErrorSubject::Snapshot(None), ErrorVerb::Read)
}

/// [`RaftStorage`] for the graph: the durable log plus the state machine.
///
/// Clones share state; openraft wraps it in an [`openraft::storage::Adaptor`] and
/// serializes access, so apply, snapshot build and install never overlap.
#[derive(Clone)]
pub struct GraphRaftStore {
    log: Arc<LogStore>,
    machine: Arc<StateMachine>,
}

impl GraphRaftStore {
    /// Opens `dir/log.redb` and `dir/snapshot.bin`, rewinding `graph` to the snapshot.
    pub fn open(dir: &Path, graph: Arc<dyn Graph>) -> StoreResult<Self> {
        fs::create_dir_all(dir).on(ErrorSubject::Store, ErrorVerb::Write)?;
        let log = LogStore::open(&dir.join(LOG_FILE))?;
        let machine = StateMachine::open(graph, dir.join(SNAPSHOT_FILE))?;
        Ok(Self {
            log: Arc::new(log),
            machine: Arc::new(machine),
        })
    }

    /// The state machine side.
    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }
}

impl RaftLogReader<TypeConfig> for GraphRaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        self.log.entries(range)
    }
}

impl RaftSnapshotBuilder<TypeConfig> for GraphRaftStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        self.machine.build_snapshot()
    }
}

impl RaftStorage<TypeConfig> for GraphRaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.save_vote(vote)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.log.read_vote()
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> Result<(), StorageError<NodeId>> {
        self.log.save_committed(committed)
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        self.log.read_committed()
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        self.log.log_state()
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        self.log.append(entries)
    }

    async fn delete_conflict_logs_since(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.truncate(log_id)
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.purge(log_id)
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>> {
        Ok((self.machine.last_applied(), self.machine.membership.read().clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<RaftResponse>, StorageError<NodeId>> {
        self.machine.apply(entries)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.machine.install(meta, snapshot.into_inner())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.machine.current.read().as_ref().map(StoredSnapshot::to_snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{Applied, Command, FailureKind};
    use crate::graph::MemoryGraph;
    use crate::model::{props, Properties};
    use crate::raft::types::RaftRequest;
    use openraft::CommittedLeaderId;

    fn normal(index: u64, command: Command) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(RaftRequest::new(command.encode().unwrap())),
        }
    }

    #[tokio::test]
    async fn apply_relays_outcomes_and_advances_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = GraphRaftStore::open(dir.path(), Arc::new(MemoryGraph::new())).unwrap();
        let responses = store
            .apply_to_state_machine(&[
                normal(1, Command::add_node("x", "1", props([("a", 1i64)]))),
                normal(2, Command::delete_node("x", "missing")),
            ])
            .await
            .unwrap();

        assert!(matches!(responses[0].outcome, Some(Ok(Applied::Node(_)))));
        let failure = responses[1].outcome.clone().unwrap().unwrap_err();
        assert_eq!(failure.kind, FailureKind::NotFound);
        let (applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(applied.map(|id| id.index), Some(2));
    }

    #[tokio::test]
    async fn unsupported_entry_stops_apply() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = GraphRaftStore::open(dir.path(), Arc::new(MemoryGraph::new())).unwrap();
        let bogus = Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), 1),
            payload: EntryPayload::Normal(RaftRequest::new(br#"{"method":"merge-nodes","payload":{}}"#.to_vec())),
        };
        assert!(store.apply_to_state_machine(&[bogus]).await.is_err());
        let (applied, _) = store.last_applied_state().await.unwrap();
        assert!(applied.is_none());
        assert!(store.state_machine().fsm().halted().is_some());
    }

    #[tokio::test]
    async fn snapshot_persists_and_restores_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let graph: Arc<dyn Graph> = Arc::new(MemoryGraph::new());
        {
            let mut store = GraphRaftStore::open(dir.path(), graph.clone()).unwrap();
            store
                .apply_to_state_machine(&[normal(1, Command::add_node("x", "1", Properties::new()))])
                .await
                .unwrap();
            let snapshot = store.build_snapshot().await.unwrap();
            assert_eq!(snapshot.meta.last_log_id.map(|id| id.index), Some(1));
            store
                .apply_to_state_machine(&[normal(2, Command::add_node("x", "2", Properties::new()))])
                .await
                .unwrap();
        }
        assert_eq!(graph.size().unwrap(), 2);

        let mut store = GraphRaftStore::open(dir.path(), graph.clone()).unwrap();
        assert_eq!(graph.size().unwrap(), 1);
        assert!(graph.get_node("x", "1").is_ok());
        let (applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(applied.map(|id| id.index), Some(1));
        assert!(store.get_current_snapshot().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn install_replaces_local_state() {
        let source_dir = tempfile::tempdir().unwrap();
        let mut source = GraphRaftStore::open(source_dir.path(), Arc::new(MemoryGraph::new())).unwrap();
        source
            .apply_to_state_machine(&[normal(1, Command::add_node("x", "1", Properties::new()))])
            .await
            .unwrap();
        let snapshot = source.build_snapshot().await.unwrap();

        let target_dir = tempfile::tempdir().unwrap();
        let graph: Arc<dyn Graph> = Arc::new(MemoryGraph::new());
        let mut target = GraphRaftStore::open(target_dir.path(), graph.clone()).unwrap();
        graph.add_node("stale", "s", Properties::new()).unwrap();
        target
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert!(graph.get_node("stale", "s").is_err());
        assert!(graph.get_node("x", "1").is_ok());
        let (applied, _) = target.last_applied_state().await.unwrap();
        assert_eq!(applied.map(|id| id.index), Some(1));
    }

    #[tokio::test]
    async fn open_without_snapshot_starts_from_an_empty_graph() {
        let dir = tempfile::tempdir().unwrap();
        let graph: Arc<dyn Graph> = Arc::new(MemoryGraph::new());
        graph.add_node("x", "leftover", Properties::new()).unwrap();

        let mut store = GraphRaftStore::open(dir.path(), graph.clone()).unwrap();
        assert_eq!(graph.size().unwrap(), 0);
        let (applied, _) = store.last_applied_state().await.unwrap();
        assert!(applied.is_none());
    }

    #[test]
    fn corrupt_snapshot_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), b"\0\0\0\0{}").unwrap();
        assert!(GraphRaftStore::open(dir.path(), Arc::new(MemoryGraph::new())).is_err());
    }
}
