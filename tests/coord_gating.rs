//! Two controllers sharing an in-process coordination store: only the
//! elected one probes and writes, and leadership moves when its session dies.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Topology;
use failoverd::cluster::coord::memory::{MemorySession, MemoryStore};
use failoverd::cluster::coord::store::CoordStore;
use failoverd::cluster::{Cluster, CoordCluster};
use failoverd::common::{Config, Metrics};
use failoverd::controller::{MasterRegistry, Orchestrator};

const M: &str = "10.0.0.1:6379";
const R1: &str = "10.0.0.2:6379";

struct Controller {
    app: Arc<Orchestrator>,
    session: Arc<MemorySession>,
}

async fn controller(store: &MemoryStore, identity: &str, topo: &Topology) -> Controller {
    controller_with(store, identity, topo, Vec::new()).await
}

async fn controller_with(
    store: &MemoryStore,
    identity: &str,
    topo: &Topology,
    masters: Vec<String>,
) -> Controller {
    let session = Arc::new(store.session());
    let registry = MasterRegistry::new();
    let cluster: Arc<dyn Cluster> = Arc::new(
        CoordCluster::with_store(session.clone(), "/failoverd", identity, registry.clone())
            .await
            .unwrap(),
    );
    let config = Config {
        addr: String::new(),
        check_interval: 500,
        max_down_time: 1,
        masters,
        ..Config::default()
    };
    let app = Orchestrator::new(
        Arc::new(config),
        cluster,
        registry,
        Arc::new(Metrics::new()),
        topo.connector(),
    );
    Controller { app, session }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_only_leader_probes_and_mutates() {
    let topo = Topology::new();
    topo.add_master(M, 100);
    topo.add_replica(R1, M, 100, 100);

    let store = MemoryStore::new();
    let a = controller(&store, "a:11000", &topo).await;
    let b = controller(&store, "b:11000", &topo).await;
    settle().await;

    let (leader, follower) = if a.app.is_leader() { (&a, &b) } else { (&b, &a) };
    assert!(leader.app.is_leader());
    assert!(!follower.app.is_leader());

    leader.app.add_masters(vec![M.to_string()]).await.unwrap();
    settle().await;
    assert_eq!(follower.app.masters(), vec![M]);

    // Off-leader writes are accepted and dropped.
    follower.app.add_masters(vec!["10.0.0.9:6379".to_string()]).await.unwrap();
    settle().await;
    assert_eq!(leader.app.masters(), vec![M]);
    assert_eq!(follower.app.masters(), vec![M]);
    assert_eq!(follower.app.metrics().registry_mutations_total.get(), 0);

    follower.app.check().await;
    assert_eq!(follower.app.metrics().probes_total.get(), 0);
    leader.app.check().await;
    assert_eq!(leader.app.metrics().probes_total.get(), 1);

    a.app.shutdown().await.unwrap();
    b.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_follower_takes_over_with_the_same_registry() {
    let topo = Topology::new();
    topo.add_master(M, 100);
    topo.add_replica(R1, M, 100, 100);

    let store = MemoryStore::new();
    let a = controller(&store, "a:11000", &topo).await;
    settle().await;
    assert!(a.app.is_leader());
    a.app.set_masters(vec![M.to_string()]).await.unwrap();

    let b = controller(&store, "b:11000", &topo).await;
    settle().await;
    assert!(!b.app.is_leader());
    assert_eq!(b.app.cluster().leader().as_deref(), Some("a:11000"));

    a.session.expire();
    settle().await;

    assert!(b.app.is_leader());
    assert!(!a.app.is_leader());
    assert_eq!(b.app.masters(), vec![M]);

    b.app.check().await;
    assert_eq!(b.app.metrics().probes_total.get(), 1);
    a.app.check().await;
    assert_eq!(a.app.metrics().probes_total.get(), 0);

    a.app.shutdown().await.unwrap();
    b.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_startup_masters_merge_with_persisted_list() {
    const PERSISTED: &str = "10.0.0.5:6379";
    let topo = Topology::new();
    topo.add_master(M, 100);
    topo.add_master(PERSISTED, 100);

    let store = MemoryStore::new();
    let seed = store.session();
    seed.ensure_path("/failoverd").await.unwrap();
    seed.set(
        "/failoverd/masters",
        serde_json::to_vec(&vec![PERSISTED]).unwrap(),
        None,
    )
    .await
    .unwrap();

    let a = controller_with(&store, "a:11000", &topo, vec![M.to_string()]).await;
    a.app.start().await.unwrap();
    settle().await;

    assert!(a.app.is_leader());
    assert_eq!(a.app.masters(), vec![M, PERSISTED]);
    let node = seed.get("/failoverd/masters").await.unwrap().unwrap();
    let persisted: Vec<String> = serde_json::from_slice(&node.data).unwrap();
    assert_eq!(persisted, vec![M, PERSISTED]);

    a.app.shutdown().await.unwrap();
}
