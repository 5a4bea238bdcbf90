//! Controller lifecycle: startup, the leader-gated check loop, failover and
//! registry mutation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::group::Group;
use super::hooks::Hooks;
use super::http;
use super::registry::{Action, Command, MasterRegistry};
use crate::cluster::Cluster;
use crate::common::{Config, Error, Metrics, Result, StartupState};
use crate::node::Connector;

/// How long startup waits for the first leadership notification.
pub const LEADERSHIP_WAIT: Duration = Duration::from_secs(5);

/// Bound on a single registry action going through the consensus backend.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Orchestrator {
    config: Arc<Config>,
    cluster: Arc<dyn Cluster>,
    registry: MasterRegistry,
    metrics: Arc<Metrics>,
    connector: Arc<dyn Connector>,
    hooks: Hooks,
    groups: Mutex<HashMap<String, Arc<Group>>>,
    /// Set once a barrier confirmed the registry reflects every action
    /// committed before this term; cleared on each leadership change.
    synced: AtomicBool,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        cluster: Arc<dyn Cluster>,
        registry: MasterRegistry,
        metrics: Arc<Metrics>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            cluster,
            registry,
            metrics,
            connector,
            hooks: Hooks::new(),
            groups: Mutex::new(HashMap::new()),
            synced: AtomicBool::new(false),
            shutdown,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn is_leader(&self) -> bool {
        self.cluster.is_leader()
    }

    /// Sorted list of registered masters.
    pub fn masters(&self) -> Vec<String> {
        self.registry.masters()
    }

    /// Wait for leadership, seed the registry from the configured masters,
    /// then start the control surface and the check loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.wait_for_leadership().await;

        let masters = self.config.masters.clone();
        let seeded = match self.config.masters_state {
            StartupState::New => self.set_masters(masters).await,
            StartupState::Existing if !masters.is_empty() => self.add_masters(masters).await,
            StartupState::Existing => Ok(()),
        };
        if let Err(e) = seeded {
            warn!(error = %e, "failed to apply configured masters");
        }

        let mut workers = Vec::new();
        if !self.config.addr.is_empty() {
            let listener = tokio::net::TcpListener::bind(&self.config.addr).await?;
            info!(addr = %self.config.addr, "control surface listening");
            let app = http::router(self.clone())
                .into_make_service_with_connect_info::<SocketAddr>();
            let mut stop = self.shutdown.subscribe();
            workers.push(tokio::spawn(async move {
                let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                    let _ = stop.changed().await;
                });
                if let Err(e) = server.await {
                    error!(error = %e, "control surface stopped");
                }
            }));
        }

        workers.push(tokio::spawn(self.clone().track_leadership(self.shutdown.subscribe())));
        workers.push(tokio::spawn(self.clone().check_loop(self.shutdown.subscribe())));
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(workers);

        info!(
            broker = self.cluster.name(),
            check_interval_ms = self.config.check_interval().as_millis() as u64,
            max_down_time_ms = self.config.max_down_time().as_millis() as u64,
            "controller started"
        );
        Ok(())
    }

    async fn wait_for_leadership(&self) {
        if self.cluster.is_leader() {
            return;
        }
        let mut changes = self.cluster.leader_changes();
        let acquired = tokio::time::timeout(LEADERSHIP_WAIT, async {
            loop {
                if *changes.borrow_and_update() {
                    return true;
                }
                if changes.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false);
        if acquired {
            info!("leadership acquired");
        } else {
            info!(
                wait_ms = LEADERSHIP_WAIT.as_millis() as u64,
                leader = ?self.cluster.leader(),
                "not leader, starting as follower"
            );
        }
    }

    async fn track_leadership(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.cluster.leader_changes();
        loop {
            let leader = *changes.borrow_and_update();
            self.metrics.is_leader.set(leader as u64);

            tokio::select! {
                res = changes.changed() => {
                    if res.is_err() {
                        break;
                    }
                    self.metrics.leadership_changes_total.inc();
                    self.synced.store(false, Ordering::Release);
                    info!(leader = *changes.borrow(), "leadership changed");
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn check_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            // a round stuck on unresponsive nodes must not hold up shutdown
            tokio::select! {
                _ = self.check() => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("check loop stopped");
    }

    /// One round of probes: a concurrent probe per registered master. Only
    /// the leader probes; followers just keep their registry view.
    pub async fn check(self: &Arc<Self>) {
        self.metrics.monitored_masters.set(self.registry.len() as u64);
        if !self.cluster.is_leader() {
            self.synced.store(false, Ordering::Release);
            return;
        }
        if !self.synced.load(Ordering::Acquire) {
            if let Err(e) = self.cluster.barrier(APPLY_TIMEOUT).await {
                warn!(error = %e, "registry not caught up with the leader's log, skipping round");
                return;
            }
            self.synced.store(true, Ordering::Release);
            debug!(masters = self.registry.len(), "registry caught up, probing");
        }

        let probes: Vec<(String, Arc<Group>)> = {
            let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
            self.registry
                .masters()
                .into_iter()
                .map(|addr| {
                    let group = groups
                        .entry(addr.clone())
                        .or_insert_with(|| Arc::new(Group::new(&addr, self.connector.clone())))
                        .clone();
                    (addr, group)
                })
                .collect()
        };

        let mut set = JoinSet::new();
        for (addr, group) in probes {
            set.spawn(self.clone().probe(addr, group));
        }
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "probe task panicked");
            }
        }

        let stale: Vec<(String, Arc<Group>)> = {
            let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
            let gone: Vec<String> = groups
                .keys()
                .filter(|addr| !self.registry.contains(addr))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|addr| groups.remove(&addr).map(|g| (addr, g)))
                .collect()
        };
        for (addr, group) in stale {
            info!(master = %addr, "master deregistered, closing group");
            group.close().await;
        }
    }

    async fn probe(self: Arc<Self>, addr: String, group: Arc<Group>) {
        let start = Instant::now();
        self.metrics.probes_total.inc();
        let result = group.check().await;
        self.metrics
            .probe_duration_ms
            .observe(start.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(()) => {}
            Err(Error::NodeType(reason)) => {
                warn!(master = %addr, reason = %reason, "registered address is not a master, deregistering");
                if let Err(e) = self.del_masters(vec![addr.clone()]).await {
                    warn!(master = %addr, error = %e, "failed to deregister address");
                }
            }
            Err(e) => {
                self.metrics.probe_failures_total.inc();
                let interval = self.config.check_interval();
                if group
                    .downtime_exceeded(interval, self.config.max_down_time())
                    .await
                {
                    self.failover(&addr, &group).await;
                } else {
                    let failures = group.failures().await;
                    warn!(master = %addr, failures, error = %e, "master probe failed");
                }
            }
        }
    }

    /// Replace a dead master: deregister it, run hooks, elect and promote a
    /// replica, then register the replacement.
    async fn failover(&self, addr: &str, group: &Arc<Group>) {
        let downtime = self.config.check_interval() * group.failures().await;
        warn!(master = %addr, downtime_ms = downtime.as_millis() as u64, "master is down, failing over");

        if let Err(e) = self.del_masters(vec![addr.to_string()]).await {
            warn!(master = %addr, error = %e, "failed to deregister dead master");
        }

        if let Err(e) = self.hooks.run_before(addr) {
            info!(master = %addr, error = %e, "failover given up by hook");
            self.metrics.failovers_aborted_total.inc();
            return;
        }

        let candidate = match group.elect().await {
            Ok(candidate) => candidate,
            Err(e) => {
                match e {
                    Error::NodeAlive(_) => {
                        warn!(master = %addr, error = %e, "a replica still sees the master, not promoting")
                    }
                    _ => warn!(master = %addr, error = %e, "failover aborted"),
                }
                self.metrics.failovers_aborted_total.inc();
                return;
            }
        };

        if let Err(e) = group.promote(&candidate).await {
            error!(
                fatal = true,
                master = %addr,
                replica = %candidate,
                error = %e,
                "promotion failed, group needs operator intervention"
            );
            self.metrics.promotions_failed_total.inc();
            return;
        }

        {
            let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
            groups.remove(addr);
            groups.insert(candidate.clone(), group.clone());
        }
        if let Err(e) = self.add_masters(vec![candidate.clone()]).await {
            error!(master = %addr, new_master = %candidate, error = %e, "failed to register new master");
        }

        if let Err(e) = self.hooks.run_after(addr, &candidate) {
            info!(master = %addr, new_master = %candidate, error = %e, "after failover hooks given up");
        }

        self.metrics.failovers_total.inc();
        info!(master = %addr, new_master = %candidate, "failover completed");
    }

    pub async fn add_masters(&self, masters: Vec<String>) -> Result<()> {
        self.mutate(Action::add(masters)).await
    }

    pub async fn set_masters(&self, masters: Vec<String>) -> Result<()> {
        self.mutate(Action::set(masters)).await
    }

    pub async fn del_masters(&self, masters: Vec<String>) -> Result<()> {
        self.mutate(Action::del(masters)).await
    }

    /// Mutations off the leader are skipped, not rejected.
    async fn mutate(&self, action: Action) -> Result<()> {
        if action.masters.is_empty() && action.cmd != Command::Set {
            return Ok(());
        }
        if !self.cluster.is_leader() {
            info!(cmd = %action.cmd, masters = ?action.masters, "not leader, skipping registry update");
            return Ok(());
        }
        self.cluster.apply(action.clone(), APPLY_TIMEOUT).await?;
        self.metrics.registry_mutations_total.inc();
        self.metrics.monitored_masters.set(self.registry.len() as u64);
        debug!(cmd = %action.cmd, masters = ?action.masters, "registry updated");
        Ok(())
    }

    /// Stop every worker, wait for them, then close groups and the backend.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let workers: Vec<_> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker panicked");
            }
        }

        let groups: Vec<Arc<Group>> = self
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, g)| g)
            .collect();
        for group in groups {
            group.close().await;
        }

        self.cluster.close().await?;
        info!("controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::node::Connection;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;

    /// Dials that never complete.
    struct Unresponsive;

    impl Connector for Unresponsive {
        fn connect<'a>(&'a self, _addr: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
            Box::pin(std::future::pending())
        }
    }

    struct Refuse;

    impl Connector for Refuse {
        fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
            Box::pin(async move { Err(Error::ConnectionFailed(addr.to_string())) })
        }
    }

    /// Single node cluster whose first `lagging` barriers fail.
    struct Lagging {
        inner: LocalCluster,
        lagging: usize,
        barriers: AtomicUsize,
    }

    impl Cluster for Lagging {
        fn name(&self) -> &'static str {
            "lagging"
        }

        fn apply(&self, action: Action, timeout: Duration) -> BoxFuture<'_, Result<()>> {
            self.inner.apply(action, timeout)
        }

        fn barrier(&self, _timeout: Duration) -> BoxFuture<'_, Result<()>> {
            let n = self.barriers.fetch_add(1, Ordering::SeqCst);
            let lagging = self.lagging;
            Box::pin(async move {
                if n < lagging {
                    Err(Error::Timeout("barrier".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn is_leader(&self) -> bool {
            self.inner.is_leader()
        }

        fn leader(&self) -> Option<String> {
            self.inner.leader()
        }

        fn leader_changes(&self) -> watch::Receiver<bool> {
            self.inner.leader_changes()
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            self.inner.close()
        }
    }

    fn config(masters: &[&str]) -> Arc<Config> {
        Arc::new(Config {
            addr: String::new(),
            masters: masters.iter().map(|m| m.to_string()).collect(),
            check_interval: 500,
            max_down_time: 1,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn test_checks_wait_for_barrier() {
        let registry = MasterRegistry::new();
        let cluster = Arc::new(Lagging {
            inner: LocalCluster::new(registry.clone()),
            lagging: 1,
            barriers: AtomicUsize::new(0),
        });
        let app = Orchestrator::new(
            config(&[]),
            cluster.clone(),
            registry,
            Arc::new(Metrics::new()),
            Arc::new(Refuse),
        );
        app.add_masters(vec!["10.0.0.1:6379".into()]).await.unwrap();

        app.check().await;
        assert_eq!(app.metrics().probes_total.get(), 0);

        app.check().await;
        assert_eq!(app.metrics().probes_total.get(), 1);

        // caught up for the rest of the term
        app.check().await;
        assert_eq!(app.metrics().probes_total.get(), 2);
        assert_eq!(cluster.barriers.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_does_not_wait_for_hung_nodes() {
        let registry = MasterRegistry::new();
        let cluster: Arc<dyn Cluster> = Arc::new(LocalCluster::new(registry.clone()));
        let app = Orchestrator::new(
            config(&["10.0.0.1:6379", "10.0.0.2:6379"]),
            cluster,
            registry,
            Arc::new(Metrics::new()),
            Arc::new(Unresponsive),
        );
        app.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(app.metrics().probes_total.get(), 2);

        tokio::time::timeout(Duration::from_secs(1), app.shutdown())
            .await
            .expect("shutdown blocked on a stuck check round")
            .unwrap();
    }
}
