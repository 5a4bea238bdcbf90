//! In-process coordination store.
//!
//! One [`MemoryStore`] is the shared namespace; each [`MemorySession`] is a
//! client of it with its own ephemeral nodes. Sessions can be expired on
//! demand, which is how tests simulate a controller losing its lease.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::store::{
    format_sequence, join_path, parent_path, CoordStore, CreateMode, NodeData, Watch, WatchEvent,
};
use crate::common::{Error, Result};

struct ZNode {
    data: Vec<u8>,
    version: i64,
    owner: Option<u64>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, ZNode>,
    watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    sequences: HashMap<String, u64>,
    next_session: u64,
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(watchers) = self.watches.remove(path) {
            for w in watchers {
                let _ = w.send(event);
            }
        }
    }

    fn watch(&mut self, path: &str) -> Watch {
        let (tx, rx) = oneshot::channel();
        self.watches.entry(path.to_string()).or_default().push(tx);
        rx
    }

    fn insert(&mut self, path: String, data: Vec<u8>, owner: Option<u64>) {
        self.nodes.insert(
            path.clone(),
            ZNode {
                data,
                version: 0,
                owner,
            },
        );
        self.fire(&path, WatchEvent::Created);
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            self.fire(path, WatchEvent::Deleted);
        }
    }

    fn drop_ephemerals(&mut self, session: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in owned {
            self.remove(&path);
        }
    }
}

/// Shared in-memory namespace.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new client session.
    pub fn session(&self) -> MemorySession {
        let id = {
            let mut tree = self.lock();
            tree.next_session += 1;
            tree.next_session
        };
        let (epoch, _) = watch::channel(0);
        MemorySession {
            store: self.clone(),
            id: AtomicU64::new(id),
            epoch,
            closed: AtomicBool::new(false),
        }
    }
}

/// One client of a [`MemoryStore`].
pub struct MemorySession {
    store: MemoryStore,
    id: AtomicU64,
    epoch: watch::Sender<u64>,
    closed: AtomicBool,
}

impl MemorySession {
    fn tree(&self) -> Result<MutexGuard<'_, Tree>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Coordination("session closed".into()));
        }
        Ok(self.store.lock())
    }

    fn session_id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Expire this session: its ephemeral nodes vanish and the client
    /// continues under a fresh session, as a reconnecting client would.
    pub fn expire(&self) {
        let mut tree = self.store.lock();
        let old = self.session_id();
        tree.drop_ephemerals(old);
        tree.next_session += 1;
        self.id.store(tree.next_session, Ordering::Release);
        drop(tree);

        debug!(session = old, "memory session expired");
        self.epoch.send_modify(|e| *e += 1);
    }

    fn create_now(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let session = self.session_id();
        let mut tree = self.tree()?;

        let parent = parent_path(path)
            .ok_or_else(|| Error::Coordination(format!("cannot create {}", path)))?;
        if !tree.exists(parent) {
            return Err(Error::Coordination(format!("parent of {} does not exist", path)));
        }

        let (path, owner) = match mode {
            CreateMode::Persistent => (path.to_string(), None),
            CreateMode::Ephemeral => (path.to_string(), Some(session)),
            CreateMode::EphemeralSequential => {
                let seq = tree.sequences.entry(parent.to_string()).or_insert(0);
                *seq += 1;
                (format_sequence(path, *seq), Some(session))
            }
        };

        if tree.exists(&path) {
            return Err(Error::Coordination(format!("node {} already exists", path)));
        }
        tree.insert(path.clone(), data, owner);
        Ok(path)
    }

    fn read(tree: &Tree, path: &str) -> Option<NodeData> {
        tree.nodes.get(path).map(|n| NodeData {
            data: n.data.clone(),
            version: n.version,
        })
    }
}

impl CoordStore for MemorySession {
    fn ensure_path<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        let result = (|| -> Result<()> {
            let mut tree = self.tree()?;
            let mut current = String::new();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                current = join_path(if current.is_empty() { "/" } else { &current }, part);
                if !tree.exists(&current) {
                    tree.insert(current.clone(), Vec::new(), None);
                }
            }
            Ok(())
        })();
        Box::pin(async move { result })
    }

    fn create<'a>(
        &'a self,
        path: &'a str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> BoxFuture<'a, Result<String>> {
        let result = self.create_now(path, data, mode);
        Box::pin(async move { result })
    }

    fn children<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        let result = self.tree().map(|tree| {
            let prefix = join_path(path, "");
            tree.nodes
                .range(prefix.clone()..)
                .take_while(|(p, _)| p.starts_with(&prefix))
                .map(|(p, _)| &p[prefix.len()..])
                .filter(|name| !name.is_empty() && !name.contains('/'))
                .map(str::to_string)
                .collect()
        });
        Box::pin(async move { result })
    }

    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<NodeData>>> {
        let result = self.tree().map(|tree| Self::read(&tree, path));
        Box::pin(async move { result })
    }

    fn get_watch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(Option<NodeData>, Watch)>> {
        let result = self.tree().map(|mut tree| {
            let data = Self::read(&tree, path);
            (data, tree.watch(path))
        });
        Box::pin(async move { result })
    }

    fn exists_watch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(bool, Watch)>> {
        let result = self.tree().map(|mut tree| {
            let exists = tree.exists(path);
            (exists, tree.watch(path))
        });
        Box::pin(async move { result })
    }

    fn set<'a>(
        &'a self,
        path: &'a str,
        data: Vec<u8>,
        expected_version: Option<i64>,
    ) -> BoxFuture<'a, Result<()>> {
        let result = (|| -> Result<()> {
            let mut tree = self.tree()?;
            if let Some(node) = tree.nodes.get_mut(path) {
                if let Some(v) = expected_version {
                    if node.version != v {
                        return Err(Error::Coordination(format!(
                            "version mismatch on {}: expected {}, found {}",
                            path, v, node.version
                        )));
                    }
                }
                node.data = data;
                node.version += 1;
                tree.fire(path, WatchEvent::Changed);
                return Ok(());
            }
            if expected_version.is_some() {
                return Err(Error::Coordination(format!("node {} does not exist", path)));
            }
            drop(tree);
            self.create_now(path, data, CreateMode::Persistent).map(|_| ())
        })();
        Box::pin(async move { result })
    }

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        let result = self.tree().map(|mut tree| tree.remove(path));
        Box::pin(async move { result })
    }

    fn session_epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.store.lock().drop_ephemerals(self.session_id());
            debug!(session = self.session_id(), "memory session closed");
        }
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_children_sort() {
        let store = MemoryStore::new();
        let s = store.session();
        s.ensure_path("/lock").await.unwrap();
        s.ensure_path("/lock").await.unwrap();

        let a = s.create("/lock/lock-", b"a".to_vec(), CreateMode::EphemeralSequential).await.unwrap();
        let b = s.create("/lock/lock-", b"b".to_vec(), CreateMode::EphemeralSequential).await.unwrap();
        assert_eq!(a, "/lock/lock-0000000001");
        assert_eq!(b, "/lock/lock-0000000002");

        let mut children = s.children("/lock").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["lock-0000000001", "lock-0000000002"]);
    }

    #[tokio::test]
    async fn test_expire_drops_ephemerals_and_fires_watch() {
        let store = MemoryStore::new();
        let owner = store.session();
        let observer = store.session();
        owner.ensure_path("/e").await.unwrap();
        owner.create("/e/node", Vec::new(), CreateMode::Ephemeral).await.unwrap();
        owner.create("/e/keep", Vec::new(), CreateMode::Persistent).await.unwrap();

        let (exists, watch) = observer.exists_watch("/e/node").await.unwrap();
        assert!(exists);

        let mut epoch = owner.session_epoch();
        owner.expire();
        assert_eq!(watch.await.unwrap(), WatchEvent::Deleted);
        assert!(epoch.has_changed().unwrap());
        assert_eq!(*epoch.borrow_and_update(), 1);
        assert!(observer.get("/e/node").await.unwrap().is_none());
        assert!(observer.get("/e/keep").await.unwrap().is_some());

        // the expired client keeps working under a new session
        owner.create("/e/node", Vec::new(), CreateMode::Ephemeral).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_versions() {
        let store = MemoryStore::new();
        let s = store.session();
        s.set("/v", b"1".to_vec(), None).await.unwrap();
        let node = s.get("/v").await.unwrap().unwrap();
        assert_eq!(node.version, 0);

        s.set("/v", b"2".to_vec(), Some(0)).await.unwrap();
        assert!(s.set("/v", b"3".to_vec(), Some(0)).await.is_err());
        assert_eq!(s.get("/v").await.unwrap().unwrap().data, b"2".to_vec());
    }

    #[tokio::test]
    async fn test_create_needs_parent_and_delete_is_idempotent() {
        let store = MemoryStore::new();
        let s = store.session();
        assert!(s.create("/a/b", Vec::new(), CreateMode::Persistent).await.is_err());
        s.delete("/nothing").await.unwrap();
    }
}
