//! Coordination-service backend.
//!
//! Controllers elect a leader through [`LeaderElection`]; only the leader
//! accepts registry actions, and a single applier task per process persists
//! each resulting master list to `<base>/masters` before publishing it
//! locally. Followers mirror that node into their own registry.

pub mod election;
pub mod etcd;
pub mod memory;
pub mod mutex;
pub mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::election::{LeaderElection, LeaderTask, PrepareTask};
use self::etcd::EtcdStore;
use self::memory::MemoryStore;
use self::store::{join_path, CoordStore};
use super::{Cluster, Leadership};
use crate::common::{CoordConfig, Error, Result};
use crate::controller::registry::{Action, MasterRegistry};

const ACTION_QUEUE: usize = 64;
const RETRY_DELAY: Duration = Duration::from_secs(1);

struct PendingAction {
    action: Action,
    reply: oneshot::Sender<Result<()>>,
    /// Set by the caller once it stopped waiting.
    abandoned: Arc<AtomicBool>,
}

pub struct CoordCluster {
    leadership: Arc<Leadership>,
    leader: Arc<Mutex<Option<String>>>,
    actions: mpsc::Sender<PendingAction>,
    store: Arc<dyn CoordStore>,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoordCluster {
    /// Connect to the configured store and join the election as `identity`.
    pub async fn start(cfg: &CoordConfig, identity: &str, registry: MasterRegistry) -> Result<Self> {
        let store: Arc<dyn CoordStore> = if cfg.is_memory() {
            warn!("coordination store is in-process, only suitable for local testing");
            Arc::new(MemoryStore::new().session())
        } else {
            Arc::new(EtcdStore::connect(&cfg.endpoints, cfg.session_ttl).await?)
        };
        Self::with_store(store, &cfg.base_dir, identity, registry).await
    }

    pub async fn with_store(
        store: Arc<dyn CoordStore>,
        base: &str,
        identity: &str,
        registry: MasterRegistry,
    ) -> Result<Self> {
        store.ensure_path(base).await?;

        let leadership = Arc::new(Leadership::new(false));
        let leader = Arc::new(Mutex::new(None));
        let (quit, _) = watch::channel(false);
        let (actions, queue) = mpsc::channel(ACTION_QUEUE);
        let masters_path = join_path(base, "masters");

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(apply_actions(
            store.clone(),
            masters_path.clone(),
            registry.clone(),
            leadership.clone(),
            queue,
            quit.subscribe(),
        )));

        let election = LeaderElection::new(store.clone(), base, identity, leadership.clone())
            .with_prepare(load_persisted(store.clone(), masters_path.clone(), registry.clone()));
        let quit_rx = quit.subscribe();
        tasks.push(tokio::spawn(async move { election.run(hold_office(), quit_rx).await }));

        tasks.push(tokio::spawn(mirror_masters(
            store.clone(),
            masters_path,
            registry,
            leadership.clone(),
            quit.subscribe(),
        )));
        tasks.push(tokio::spawn(track_leader(
            store.clone(),
            join_path(base, "leader"),
            leader.clone(),
            quit.subscribe(),
        )));

        info!(base = %base, identity = %identity, "joined coordination election");
        Ok(Self {
            leadership,
            leader,
            actions,
            store,
            quit,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Runs before leadership is published, so nothing can be applied on top
/// of a registry that has not caught up with `<base>/masters` yet.
fn load_persisted(store: Arc<dyn CoordStore>, path: String, registry: MasterRegistry) -> PrepareTask {
    Box::new(move || -> BoxFuture<'static, Result<()>> {
        let store = store.clone();
        let path = path.clone();
        let registry = registry.clone();
        Box::pin(async move {
            if let Some(node) = store.get(&path).await? {
                registry.restore(&node.data)?;
                info!(masters = registry.len(), "loaded persisted master list");
            }
            Ok(())
        })
    })
}

/// The orchestrator does the leader's work; the election only needs a task
/// that lasts until it is told to stop.
fn hold_office() -> LeaderTask {
    Box::new(|mut stop: watch::Receiver<bool>| -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            while !*stop.borrow_and_update() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
            Ok(())
        })
    })
}

/// Serialized applier: one action at a time, persisted before it becomes
/// visible in the local registry.
async fn apply_actions(
    store: Arc<dyn CoordStore>,
    path: String,
    registry: MasterRegistry,
    leadership: Arc<Leadership>,
    mut queue: mpsc::Receiver<PendingAction>,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        let pending = tokio::select! {
            next = queue.recv() => match next {
                Some(p) => p,
                None => break,
            },
            _ = quit.changed() => break,
        };

        if pending.abandoned.load(Ordering::Acquire) {
            debug!(cmd = %pending.action.cmd, "skipping action abandoned by its caller");
            continue;
        }

        let result = if leadership.is_leader() {
            persist(&*store, &path, &registry, &pending.action).await
        } else {
            Err(Error::NotLeader(String::new()))
        };
        let _ = pending.reply.send(result);
    }
}

async fn persist(
    store: &dyn CoordStore,
    path: &str,
    registry: &MasterRegistry,
    action: &Action,
) -> Result<()> {
    let next = registry.copy();
    next.apply(action);
    store.set(path, next.snapshot()?, None).await?;
    registry.replace_with(&next);
    debug!(cmd = %action.cmd, masters = next.len(), "action persisted");
    Ok(())
}

/// Follower side: republish the persisted master list locally.
async fn mirror_masters(
    store: Arc<dyn CoordStore>,
    path: String,
    registry: MasterRegistry,
    leadership: Arc<Leadership>,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        let watch = match store.get_watch(&path).await {
            Ok((node, watch)) => {
                if let Some(node) = node {
                    if !leadership.is_leader() {
                        if let Err(e) = registry.restore(&node.data) {
                            warn!(path = %path, error = %e, "ignoring undecodable master list");
                        }
                    }
                }
                watch
            }
            Err(e) => {
                debug!(path = %path, error = %e, "failed to read master list");
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    _ = quit.changed() => return,
                }
            }
        };
        tokio::select! {
            _ = watch => {}
            _ = quit.changed() => return,
        }
    }
}

async fn track_leader(
    store: Arc<dyn CoordStore>,
    path: String,
    leader: Arc<Mutex<Option<String>>>,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        let watch = match store.get_watch(&path).await {
            Ok((node, watch)) => {
                let current = node.and_then(|n| String::from_utf8(n.data).ok());
                *leader.lock().unwrap_or_else(|e| e.into_inner()) = current;
                watch
            }
            Err(e) => {
                debug!(path = %path, error = %e, "failed to read leader node");
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    _ = quit.changed() => return,
                }
            }
        };
        tokio::select! {
            _ = watch => {}
            _ = quit.changed() => return,
        }
    }
}

impl Cluster for CoordCluster {
    fn name(&self) -> &'static str {
        "coord"
    }

    fn apply(&self, action: Action, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.is_leader() {
                return Err(Error::NotLeader(self.leader().unwrap_or_default()));
            }

            let (reply, rx) = oneshot::channel();
            let abandoned = Arc::new(AtomicBool::new(false));
            let pending = PendingAction {
                action,
                reply,
                abandoned: abandoned.clone(),
            };

            let outcome = tokio::time::timeout(timeout, async {
                self.actions
                    .send(pending)
                    .await
                    .map_err(|_| Error::Coordination("action applier stopped".into()))?;
                rx.await
                    .map_err(|_| Error::Coordination("action applier dropped the request".into()))?
            })
            .await;

            match outcome {
                Ok(result) => result,
                Err(_) => {
                    abandoned.store(true, Ordering::Release);
                    Err(Error::AmbiguousApply(timeout))
                }
            }
        })
    }

    fn barrier(&self, _timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    fn leader(&self) -> Option<String> {
        self.leader.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn leader_changes(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let _ = self.quit.send(true);
            let tasks: Vec<_> =
                std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
            for task in tasks {
                let _ = task.await;
            }
            self.store.close().await
        })
    }
}
