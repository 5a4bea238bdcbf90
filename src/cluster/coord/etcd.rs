//! etcd-backed coordination store.
//!
//! etcd is a flat keyspace, so hierarchy is by key prefix: a node's children
//! are the keys one `/`-component below it. Ephemeral nodes are attached to
//! the session lease, and sequential suffixes come from a per-parent counter
//! key bumped in the same transaction that creates the child.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use futures_util::future::BoxFuture;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::{format_sequence, join_path, parent_path, CoordStore, CreateMode, NodeData, Watch, WatchEvent};
use crate::common::{Error, Result};

const SEQUENCE_PREFIX: &str = "/__seq";
const REGRANT_DELAY: Duration = Duration::from_secs(1);

pub struct EtcdStore {
    client: Client,
    ttl: i64,
    lease: Arc<AtomicI64>,
    epoch: Arc<watch::Sender<u64>>,
    shutdown: watch::Sender<bool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdStore {
    /// Connect and open a session lease of `ttl` seconds.
    pub async fn connect(endpoints: &[String], ttl: i64) -> Result<Self> {
        let mut client = Client::connect(endpoints, None).await?;
        let lease = client.lease_grant(ttl, None).await?.id();
        info!(?endpoints, lease, ttl, "connected to etcd");

        let lease = Arc::new(AtomicI64::new(lease));
        let (epoch, _) = watch::channel(0);
        let epoch = Arc::new(epoch);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let keepalive = tokio::spawn(keep_alive(
            client.clone(),
            ttl,
            lease.clone(),
            epoch.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            client,
            ttl,
            lease,
            epoch,
            shutdown,
            keepalive: Mutex::new(Some(keepalive)),
        })
    }

    fn client(&self) -> Client {
        self.client.clone()
    }

    fn lease(&self) -> i64 {
        self.lease.load(Ordering::Acquire)
    }

    async fn create_sequential(&self, prefix: &str, data: Vec<u8>) -> Result<String> {
        let parent = parent_path(prefix).unwrap_or("/");
        let counter = format!("{}{}", SEQUENCE_PREFIX, parent);
        let mut client = self.client();

        loop {
            let resp = client.get(counter.as_str(), None).await?;
            let (current, version) = match resp.kvs().first() {
                Some(kv) => {
                    let current = kv
                        .value_str()?
                        .parse::<u64>()
                        .map_err(|e| Error::Coordination(format!("bad sequence counter: {}", e)))?;
                    (current, kv.version())
                }
                None => (0, 0),
            };

            let next = current + 1;
            let path = format_sequence(prefix, next);
            let txn = Txn::new()
                .when(vec![
                    Compare::version(counter.as_str(), CompareOp::Equal, version),
                    Compare::version(path.as_str(), CompareOp::Equal, 0),
                ])
                .and_then(vec![
                    TxnOp::put(counter.as_str(), next.to_string(), None),
                    TxnOp::put(
                        path.as_str(),
                        data.clone(),
                        Some(PutOptions::new().with_lease(self.lease())),
                    ),
                ]);
            if client.txn(txn).await?.succeeded() {
                return Ok(path);
            }
            debug!(counter = %counter, "sequence counter contended, retrying");
        }
    }

    async fn watch_from(&self, path: &str, revision: i64) -> Result<Watch> {
        let (tx, rx) = oneshot::channel();
        let (watcher, stream) = self
            .client()
            .watch(path, Some(WatchOptions::new().with_start_revision(revision + 1)))
            .await?;
        tokio::spawn(forward_first_event(watcher, stream, tx));
        Ok(rx)
    }

    async fn read(&self, path: &str) -> Result<(Option<NodeData>, i64)> {
        let resp = self.client().get(path, None).await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let node = resp.kvs().first().map(|kv| NodeData {
            data: kv.value().to_vec(),
            version: kv.version(),
        });
        Ok((node, revision))
    }
}

async fn forward_first_event(
    mut watcher: etcd_client::Watcher,
    mut stream: etcd_client::WatchStream,
    mut tx: oneshot::Sender<WatchEvent>,
) {
    let event = loop {
        tokio::select! {
            _ = tx.closed() => break None,
            msg = stream.message() => match msg {
                Ok(Some(resp)) => {
                    if resp.canceled() {
                        break Some(WatchEvent::Closed);
                    }
                    if let Some(ev) = resp.events().first() {
                        let kind = match ev.event_type() {
                            EventType::Delete => WatchEvent::Deleted,
                            EventType::Put if ev.kv().map(|kv| kv.version()) == Some(1) => {
                                WatchEvent::Created
                            }
                            EventType::Put => WatchEvent::Changed,
                        };
                        break Some(kind);
                    }
                }
                Ok(None) | Err(_) => break Some(WatchEvent::Closed),
            },
        }
    };
    if let Some(event) = event {
        let _ = tx.send(event);
    }
    let _ = watcher.cancel().await;
}

/// Refresh the session lease; when it is lost, grant a new one and bump the
/// epoch so holders of ephemeral nodes know they are gone.
async fn keep_alive(
    mut client: Client,
    ttl: i64,
    lease: Arc<AtomicI64>,
    epoch: Arc<watch::Sender<u64>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_millis((ttl.max(1) as u64 * 1000) / 3);
    loop {
        let id = lease.load(Ordering::Acquire);
        let alive = async {
            let (mut keeper, mut stream) = client.lease_keep_alive(id).await?;
            loop {
                keeper.keep_alive().await?;
                match stream.message().await? {
                    Some(resp) if resp.ttl() > 0 => {}
                    _ => return Ok::<(), etcd_client::Error>(()),
                }
                tokio::time::sleep(period).await;
            }
        };

        tokio::select! {
            result = alive => {
                match result {
                    Ok(()) => warn!(lease = id, "etcd lease expired"),
                    Err(e) => warn!(lease = id, error = %e, "etcd lease keep-alive failed"),
                }
            }
            _ = shutdown.changed() => return,
        }

        loop {
            match client.lease_grant(ttl, None).await {
                Ok(resp) => {
                    lease.store(resp.id(), Ordering::Release);
                    epoch.send_modify(|e| *e += 1);
                    info!(lease = resp.id(), "etcd session renewed with a new lease");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "failed to grant etcd lease");
                    tokio::select! {
                        _ = tokio::time::sleep(REGRANT_DELAY) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }
}

impl CoordStore for EtcdStore {
    fn ensure_path<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<()>> {
        // prefixes need no parent keys
        Box::pin(async { Ok(()) })
    }

    fn create<'a>(
        &'a self,
        path: &'a str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let options = match mode {
                CreateMode::Persistent => None,
                CreateMode::Ephemeral => Some(PutOptions::new().with_lease(self.lease())),
                CreateMode::EphemeralSequential => return self.create_sequential(path, data).await,
            };
            let txn = Txn::new()
                .when(vec![Compare::version(path, CompareOp::Equal, 0)])
                .and_then(vec![TxnOp::put(path, data, options)]);
            if self.client().txn(txn).await?.succeeded() {
                Ok(path.to_string())
            } else {
                Err(Error::Coordination(format!("node {} already exists", path)))
            }
        })
    }

    fn children<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let prefix = join_path(path, "");
            let resp = self
                .client()
                .get(prefix.as_str(), Some(GetOptions::new().with_prefix().with_keys_only()))
                .await?;
            let mut names = Vec::new();
            for kv in resp.kvs() {
                let key = kv.key_str()?;
                let name = &key[prefix.len()..];
                if !name.is_empty() && !name.contains('/') {
                    names.push(name.to_string());
                }
            }
            Ok(names)
        })
    }

    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<NodeData>>> {
        Box::pin(async move { Ok(self.read(path).await?.0) })
    }

    fn get_watch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(Option<NodeData>, Watch)>> {
        Box::pin(async move {
            let (node, revision) = self.read(path).await?;
            let watch = self.watch_from(path, revision).await?;
            Ok((node, watch))
        })
    }

    fn exists_watch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(bool, Watch)>> {
        Box::pin(async move {
            let (node, revision) = self.read(path).await?;
            let watch = self.watch_from(path, revision).await?;
            Ok((node.is_some(), watch))
        })
    }

    fn set<'a>(
        &'a self,
        path: &'a str,
        data: Vec<u8>,
        expected_version: Option<i64>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut client = self.client();
            match expected_version {
                None => {
                    client.put(path, data, None).await?;
                    Ok(())
                }
                Some(version) => {
                    let txn = Txn::new()
                        .when(vec![Compare::version(path, CompareOp::Equal, version)])
                        .and_then(vec![TxnOp::put(path, data, None)]);
                    if client.txn(txn).await?.succeeded() {
                        Ok(())
                    } else {
                        Err(Error::Coordination(format!("version mismatch on {}", path)))
                    }
                }
            }
        })
    }

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.client().delete(path, None).await?;
            Ok(())
        })
    }

    fn session_epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let _ = self.shutdown.send(true);
            let handle = self
                .keepalive
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            if let Err(e) = self.client().lease_revoke(self.lease()).await {
                debug!(error = %e, "failed to revoke etcd lease");
            }
            debug!(ttl = self.ttl, "etcd session closed");
            Ok(())
        })
    }
}
