//! Log-replicated backend.
//!
//! A static peer set replicates registry actions through openraft. Each peer
//! applies committed actions to its own registry, and leadership follows
//! the raft leader.

pub mod network;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{BasicNode, Entry, Raft, RaftMetrics, RaftTypeConfig, ServerState, SnapshotPolicy};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use self::network::{Network, RaftService};
use self::store::RaftStore;
use super::{Cluster, Leadership};
use crate::common::{Error, RaftConfig, Result, StartupState};
use crate::controller::registry::{Action, MasterRegistry};

/// Type configuration for openraft.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeConfig;

impl RaftTypeConfig for TypeConfig {
    type D = Action;
    type R = ActionResponse;
    type Node = BasicNode;
    type NodeId = u64;
    type Entry = Entry<TypeConfig>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
}

/// Result of applying one log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionResponse {
    /// Registry size after the entry was applied.
    pub masters: usize,
}

/// Stable raft node id derived from a peer address.
pub fn node_id(addr: &str) -> u64 {
    let hash = blake3::hash(addr.as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(id)
}

fn raft_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Raft(e.to_string())
}

pub struct RaftCluster {
    raft: Raft<TypeConfig>,
    store: Arc<RaftStore>,
    leadership: Arc<Leadership>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftCluster {
    /// Open the store, start raft and its gRPC listener, and bootstrap the
    /// membership on first start.
    pub async fn start(cfg: &RaftConfig, registry: MasterRegistry) -> Result<Self> {
        if cfg.cluster_state == StartupState::New {
            warn!(dir = %cfg.data_dir.display(), "cluster state is new, discarding saved raft state");
            RaftStore::wipe(&cfg.data_dir)?;
        }
        std::fs::create_dir_all(&cfg.data_dir)?;

        let store = RaftStore::open(&cfg.data_dir, registry)?;

        let mut peers: BTreeSet<String> = cfg.cluster.iter().cloned().collect();
        peers.insert(cfg.addr.clone());
        if cfg.cluster_state == StartupState::Existing {
            peers.extend(store.saved_peers()?);
        }
        let peers: Vec<String> = peers.into_iter().collect();
        store.save_peers(&peers)?;

        if peers.len() == 1 {
            warn!(addr = %cfg.addr, "raft runs with a single peer, only suitable for local testing");
        }

        let config = openraft::Config {
            cluster_name: "failoverd".to_string(),
            heartbeat_interval: cfg.heartbeat_interval_ms,
            election_timeout_min: cfg.election_timeout_ms,
            election_timeout_max: cfg.election_timeout_ms * 2,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(cfg.snapshot_logs),
            ..Default::default()
        }
        .validate()
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let id = node_id(&cfg.addr);
        let (log_store, state_machine) = openraft::storage::Adaptor::new(store.clone());
        let raft = Raft::new(id, Arc::new(config), Network, log_store, state_machine)
            .await
            .map_err(raft_err)?;

        let bind: SocketAddr = cfg
            .addr
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid raft address {}", cfg.addr)))?;

        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        let mut stop = shutdown.subscribe();
        let service = RaftService::new(raft.clone()).into_server();
        tasks.push(tokio::spawn(async move {
            let server = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_shutdown(bind, async move {
                    let _ = stop.changed().await;
                });
            if let Err(e) = server.await {
                error!(addr = %bind, error = %e, "raft transport stopped");
            }
        }));
        info!(addr = %bind, id, peers = ?peers, "raft transport listening");

        if store.is_fresh().await {
            let members: BTreeMap<u64, BasicNode> = peers
                .iter()
                .map(|p| (node_id(p), BasicNode { addr: p.clone() }))
                .collect();
            match raft.initialize(members).await {
                Ok(()) => info!("raft membership initialized"),
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {}
                Err(e) => return Err(raft_err(e)),
            }
        }

        let leadership = Arc::new(Leadership::new(false));
        tasks.push(tokio::spawn(watch_leadership(
            raft.clone(),
            leadership.clone(),
            peers,
            shutdown.subscribe(),
        )));

        Ok(Self {
            raft,
            store,
            leadership,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    fn metrics(&self) -> RaftMetrics<u64, BasicNode> {
        self.raft.metrics().borrow().clone()
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(Error::NotLeader(self.leader().unwrap_or_default()))
        }
    }

    fn save_membership_peers(&self) -> Result<()> {
        let peers: Vec<String> = self
            .metrics()
            .membership_config
            .membership()
            .nodes()
            .map(|(_, n)| n.addr.clone())
            .collect();
        self.store.save_peers(&peers)
    }
}

/// Mirror the raft server state into `leadership`. On taking office the
/// leader adds configured peers missing from the committed membership.
async fn watch_leadership(
    raft: Raft<TypeConfig>,
    leadership: Arc<Leadership>,
    peers: Vec<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut metrics = raft.metrics();
    loop {
        let is_leader = metrics.borrow_and_update().state == ServerState::Leader;
        if leadership.set(is_leader) {
            info!(leader = is_leader, "raft leadership changed");
            if is_leader {
                if let Err(e) = join_missing_peers(&raft, &peers).await {
                    warn!(error = %e, "failed to add configured peers to membership");
                }
            }
        }

        tokio::select! {
            res = metrics.changed() => {
                if res.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    leadership.set(false);
}

async fn join_missing_peers(raft: &Raft<TypeConfig>, peers: &[String]) -> Result<()> {
    let membership = raft.metrics().borrow().membership_config.clone();
    let mut voters: BTreeSet<u64> = membership.membership().voter_ids().collect();

    let missing: Vec<&String> = peers
        .iter()
        .filter(|p| !voters.contains(&node_id(p)))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    for peer in &missing {
        let id = node_id(peer);
        raft.add_learner(id, BasicNode { addr: (*peer).clone() }, true)
            .await
            .map_err(raft_err)?;
        voters.insert(id);
    }
    raft.change_membership(voters, false)
        .await
        .map_err(raft_err)?;
    info!(peers = ?missing, "configured peers joined the membership");
    Ok(())
}

impl Cluster for RaftCluster {
    fn name(&self) -> &'static str {
        "raft"
    }

    fn apply(&self, action: Action, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.raft.client_write(action)).await {
                Err(_) => Err(Error::AmbiguousApply(timeout)),
                Ok(Ok(_)) => Ok(()),
                Ok(Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)))) => {
                    Err(Error::NotLeader(
                        fwd.leader_node.map(|n| n.addr).unwrap_or_default(),
                    ))
                }
                Ok(Err(e)) => Err(raft_err(e)),
            }
        })
    }

    fn barrier(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.raft.ensure_linearizable()).await {
                Err(_) => Err(Error::Timeout(format!("barrier after {:?}", timeout))),
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(raft_err(e)),
            }
        })
    }

    fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    fn leader(&self) -> Option<String> {
        let metrics = self.metrics();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|n| n.addr.clone())
    }

    fn leader_changes(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    fn peers(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let metrics = self.metrics();
            let mut peers: Vec<String> = metrics
                .membership_config
                .membership()
                .nodes()
                .map(|(_, n)| n.addr.clone())
                .collect();
            peers.sort();
            Ok(peers)
        })
    }

    fn add_peer(&self, addr: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_leader()?;
            let id = node_id(&addr);
            self.raft
                .add_learner(id, BasicNode { addr: addr.clone() }, true)
                .await
                .map_err(raft_err)?;

            let mut voters: BTreeSet<u64> = self
                .metrics()
                .membership_config
                .membership()
                .voter_ids()
                .collect();
            voters.insert(id);
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(raft_err)?;

            info!(peer = %addr, "peer added");
            self.save_membership_peers()
        })
    }

    fn remove_peer(&self, addr: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_leader()?;
            let id = node_id(&addr);
            let mut voters: BTreeSet<u64> = self
                .metrics()
                .membership_config
                .membership()
                .voter_ids()
                .collect();
            if !voters.remove(&id) {
                return Ok(());
            }
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(raft_err)?;

            info!(peer = %addr, "peer removed");
            self.save_membership_peers()
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let _ = self.shutdown.send(true);
            if let Err(e) = self.raft.shutdown().await {
                warn!(error = %e, "raft shutdown failed");
            }
            let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
            for task in tasks {
                let _ = task.await;
            }
            Ok(())
        })
    }
}
