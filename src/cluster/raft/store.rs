//! RocksDB-backed raft log, vote and snapshot storage.
//!
//! Stores:
//! - Log entries (`logs` column family, keyed by big-endian index)
//! - Vote, purge marker, latest snapshot and peer list (`meta`)
//!
//! Entries are cached in memory and written through. The state machine is
//! the master registry; it is rebuilt from the latest snapshot on open and
//! openraft re-applies the log entries that follow it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftStorage, SnapshotMeta, StorageError,
    StorageIOError, StoredMembership, Vote,
};
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::{ActionResponse, TypeConfig};
use crate::common::{Error, Result};
use crate::controller::registry::MasterRegistry;

const CF_LOGS: &str = "logs";
const CF_META: &str = "meta";

const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged";
const KEY_SNAPSHOT: &[u8] = b"snapshot";
const KEY_PEERS: &[u8] = b"peers";

/// Registry snapshot as shipped between peers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistrySnapshot {
    pub last_applied: Option<LogId<u64>>,
    pub last_membership: StoredMembership<u64, BasicNode>,
    pub masters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<u64, BasicNode>,
    data: Vec<u8>,
}

/// Combined log and state machine storage.
pub struct RaftStore {
    db: DB,
    vote: RwLock<Option<Vote<u64>>>,
    log: RwLock<BTreeMap<u64, Entry<TypeConfig>>>,
    last_purged: RwLock<Option<LogId<u64>>>,
    last_applied: RwLock<Option<LogId<u64>>>,
    last_membership: RwLock<StoredMembership<u64, BasicNode>>,
    snapshot: RwLock<Option<StoredSnapshot>>,
    registry: MasterRegistry,
}

impl Debug for RaftStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftStore").finish_non_exhaustive()
    }
}

impl RaftStore {
    /// Open or create the store under `path`, restoring `registry` from the
    /// latest snapshot.
    pub fn open(path: impl AsRef<Path>, registry: MasterRegistry) -> Result<Arc<Self>> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path.as_ref(), vec![CF_LOGS, CF_META])?;

        let mut log = BTreeMap::new();
        {
            let cf = cf(&db, CF_LOGS)?;
            for item in db.iterator_cf(cf, IteratorMode::Start) {
                let (_, value) = item?;
                let entry: Entry<TypeConfig> = bincode::deserialize(&value)?;
                log.insert(entry.log_id.index, entry);
            }
        }

        let vote: Option<Vote<u64>> = get_meta(&db, KEY_VOTE)?;
        let last_purged: Option<LogId<u64>> = get_meta(&db, KEY_LAST_PURGED)?;
        let snapshot: Option<StoredSnapshot> = get_meta(&db, KEY_SNAPSHOT)?;

        let mut last_applied = None;
        let mut last_membership = StoredMembership::default();
        if let Some(stored) = &snapshot {
            let snap: RegistrySnapshot = serde_json::from_slice(&stored.data)?;
            registry.apply(&crate::controller::registry::Action::set(snap.masters.clone()));
            last_applied = snap.last_applied;
            last_membership = snap.last_membership;
            info!(masters = snap.masters.len(), "registry restored from snapshot");
        }

        info!(
            path = %path.as_ref().display(),
            entries = log.len(),
            "raft store opened"
        );

        Ok(Arc::new(Self {
            db,
            vote: RwLock::new(vote),
            log: RwLock::new(log),
            last_purged: RwLock::new(last_purged),
            last_applied: RwLock::new(last_applied),
            last_membership: RwLock::new(last_membership),
            snapshot: RwLock::new(snapshot),
            registry,
        }))
    }

    /// Remove everything persisted under `path`.
    pub fn wipe(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    /// Whether nothing was ever persisted: no vote, no log, no snapshot.
    pub async fn is_fresh(&self) -> bool {
        self.vote.read().await.is_none()
            && self.log.read().await.is_empty()
            && self.snapshot.read().await.is_none()
    }

    pub fn saved_peers(&self) -> Result<Vec<String>> {
        Ok(get_meta(&self.db, KEY_PEERS)?.unwrap_or_default())
    }

    pub fn save_peers(&self, peers: &[String]) -> Result<()> {
        put_meta(&self.db, KEY_PEERS, &peers)
    }

    fn put_entries<'a>(&self, entries: impl Iterator<Item = &'a Entry<TypeConfig>>) -> Result<()> {
        let cf = cf(&self.db, CF_LOGS)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(cf, entry.log_id.index.to_be_bytes(), bincode::serialize(entry)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn delete_entries(&self, indexes: &[u64]) -> Result<()> {
        let cf = cf(&self.db, CF_LOGS)?;
        let mut batch = WriteBatch::default();
        for index in indexes {
            batch.delete_cf(cf, index.to_be_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
}

fn get_meta<T: DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    let cf = cf(db, CF_META)?;
    match db.get_cf(cf, key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn put_meta<T: Serialize>(db: &DB, key: &[u8], value: &T) -> Result<()> {
    let cf = cf(db, CF_META)?;
    db.put_cf(cf, key, serde_json::to_vec(value)?)?;
    Ok(())
}

impl RaftLogReader<TypeConfig> for Arc<RaftStore> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, v)| v.clone()).collect())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<RaftStore> {
    async fn build_snapshot(
        &mut self,
    ) -> std::result::Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();

        let snap = RegistrySnapshot {
            last_applied,
            last_membership: membership.clone(),
            masters: self.registry.masters(),
        };
        let data =
            serde_json::to_vec(&snap).map_err(|e| StorageIOError::write_snapshot(None, &e))?;

        let snapshot_id = last_applied
            .map(|id| format!("{}-{}", id.leader_id, id.index))
            .unwrap_or_else(|| "0-0".to_string());

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        put_meta(&self.db, KEY_SNAPSHOT, &stored)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        *self.snapshot.write().await = Some(stored);

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for Arc<RaftStore> {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(
        &mut self,
    ) -> std::result::Result<LogState<TypeConfig>, StorageError<u64>> {
        let log = self.log.read().await;
        let purged = *self.last_purged.read().await;
        let last = log.iter().next_back().map(|(_, e)| e.log_id).or(purged);

        Ok(LogState {
            last_purged_log_id: purged,
            last_log_id: last,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> std::result::Result<(), StorageError<u64>> {
        put_meta(&self.db, KEY_VOTE, vote).map_err(|e| StorageIOError::write_vote(&e))?;
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> std::result::Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Arc::clone(self)
    }

    async fn append_to_log<I>(&mut self, entries: I) -> std::result::Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        self.put_entries(entries.iter())
            .map_err(|e| StorageIOError::write_logs(&e))?;

        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<u64>,
    ) -> std::result::Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        let to_remove: Vec<_> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        self.delete_entries(&to_remove)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        for key in to_remove {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<u64>,
    ) -> std::result::Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        let to_remove: Vec<_> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        self.delete_entries(&to_remove)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        put_meta(&self.db, KEY_LAST_PURGED, &log_id).map_err(|e| StorageIOError::write_logs(&e))?;
        for key in to_remove {
            log.remove(&key);
        }
        *self.last_purged.write().await = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> std::result::Result<
        (Option<LogId<u64>>, StoredMembership<u64, BasicNode>),
        StorageError<u64>,
    > {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> std::result::Result<Vec<ActionResponse>, StorageError<u64>> {
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            *self.last_applied.write().await = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => {}
                EntryPayload::Normal(action) => self.registry.apply(action),
                EntryPayload::Membership(m) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), m.clone());
                }
            }
            results.push(ActionResponse {
                masters: self.registry.len(),
            });
        }

        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> std::result::Result<(), StorageError<u64>> {
        let data = snapshot.into_inner();
        let snap: RegistrySnapshot = serde_json::from_slice(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        put_meta(&self.db, KEY_SNAPSHOT, &stored)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        self.registry
            .apply(&crate::controller::registry::Action::set(snap.masters));
        *self.last_applied.write().await = snap.last_applied;
        *self.last_membership.write().await = snap.last_membership;
        *self.snapshot.write().await = Some(stored);

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        let snap = self.snapshot.read().await;
        Ok(snap.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::registry::Action;
    use openraft::CommittedLeaderId;

    fn log_id(term: u64, index: u64) -> LogId<u64> {
        LogId::new(CommittedLeaderId::new(term, 0), index)
    }

    fn normal(index: u64, action: Action) -> Entry<TypeConfig> {
        Entry {
            log_id: log_id(1, index),
            payload: EntryPayload::Normal(action),
        }
    }

    #[tokio::test]
    async fn test_apply_updates_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MasterRegistry::new();
        let mut store = RaftStore::open(dir.path(), registry.clone()).unwrap();

        let results = store
            .apply_to_state_machine(&[
                normal(1, Action::add(["a:1", "b:2"])),
                normal(2, Action::del(["a:1"])),
            ])
            .await
            .unwrap();

        assert_eq!(results.last().unwrap().masters, 1);
        assert_eq!(registry.masters(), vec!["b:2"]);
        let (applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(applied, Some(log_id(1, 2)));
    }

    #[tokio::test]
    async fn test_log_and_vote_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = RaftStore::open(dir.path(), MasterRegistry::new()).unwrap();
            store
                .append_to_log(vec![
                    normal(1, Action::add(["a:1"])),
                    normal(2, Action::add(["b:2"])),
                    normal(3, Action::add(["c:3"])),
                ])
                .await
                .unwrap();
            store.save_vote(&Vote::new(2, 7)).await.unwrap();
            store.delete_conflict_logs_since(log_id(1, 3)).await.unwrap();
            store.save_peers(&["127.0.0.1:12000".to_string()]).unwrap();
        }

        let mut store = RaftStore::open(dir.path(), MasterRegistry::new()).unwrap();
        assert!(!store.is_fresh().await);
        assert_eq!(store.read_vote().await.unwrap(), Some(Vote::new(2, 7)));
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 2)));
        assert_eq!(store.saved_peers().unwrap(), vec!["127.0.0.1:12000"]);
    }

    #[tokio::test]
    async fn test_purge_keeps_last_log_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RaftStore::open(dir.path(), MasterRegistry::new()).unwrap();
        store
            .append_to_log(vec![normal(1, Action::add(["a:1"])), normal(2, Action::add(["b:2"]))])
            .await
            .unwrap();
        store.purge_logs_upto(log_id(1, 2)).await.unwrap();

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(log_id(1, 2)));
        assert_eq!(state.last_log_id, Some(log_id(1, 2)));
        let mut reader = store.get_log_reader().await;
        assert!(reader.try_get_log_entries(0..10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_restores_registry_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = MasterRegistry::new();
            let mut store = RaftStore::open(dir.path(), registry.clone()).unwrap();
            store
                .apply_to_state_machine(&[normal(1, Action::set(["a:1", "b:2"]))])
                .await
                .unwrap();
            let mut builder = store.get_snapshot_builder().await;
            let snap = builder.build_snapshot().await.unwrap();
            assert_eq!(snap.meta.last_log_id, Some(log_id(1, 1)));
        }

        let registry = MasterRegistry::new();
        let mut store = RaftStore::open(dir.path(), registry.clone()).unwrap();
        assert_eq!(registry.masters(), vec!["a:1", "b:2"]);
        let (applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(applied, Some(log_id(1, 1)));
    }

    #[tokio::test]
    async fn test_install_snapshot_replaces_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MasterRegistry::new();
        registry.apply(&Action::add(["stale:0"]));
        let mut store = RaftStore::open(dir.path(), registry.clone()).unwrap();

        let snap = RegistrySnapshot {
            last_applied: Some(log_id(3, 9)),
            last_membership: StoredMembership::default(),
            masters: vec!["x:1".to_string()],
        };
        let meta = SnapshotMeta {
            last_log_id: Some(log_id(3, 9)),
            last_membership: StoredMembership::default(),
            snapshot_id: "3-9".to_string(),
        };
        store
            .install_snapshot(&meta, Box::new(Cursor::new(serde_json::to_vec(&snap).unwrap())))
            .await
            .unwrap();

        assert_eq!(registry.masters(), vec!["x:1"]);
        assert!(store.get_current_snapshot().await.unwrap().is_some());
    }
}
