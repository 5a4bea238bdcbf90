//! Leader election on top of [`DistributedMutex`].
//!
//! The candidate that wins the mutex writes its identity to `<base>/leader`,
//! reads it back, and then runs the leader task until it loses the node,
//! loses its session, or is asked to quit.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::mutex::DistributedMutex;
use super::store::{join_path, CoordStore, WatchEvent};
use crate::cluster::Leadership;
use crate::common::{Error, Result};

const RETRY_DELAY_MS: u64 = 1000;

/// Failed rounds back off for one to one and a half seconds.
fn retry_delay() -> Duration {
    Duration::from_millis(RETRY_DELAY_MS + rand::random::<u64>() % (RETRY_DELAY_MS / 2))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    AwaitingTurn,
    Leading,
    SteppingDown,
}

/// Work done while leading. Receives a stop signal that flips to true when
/// leadership is lost.
pub type LeaderTask =
    Box<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Runs after the leader node is claimed and before leadership is
/// published. A failure abandons the round.
pub type PrepareTask = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

enum Exit {
    StepDown,
    Quit,
}

pub struct LeaderElection {
    store: Arc<dyn CoordStore>,
    base: String,
    identity: String,
    leadership: Arc<Leadership>,
    prepare: Option<PrepareTask>,
    state: watch::Sender<ElectionState>,
}

impl LeaderElection {
    pub fn new(
        store: Arc<dyn CoordStore>,
        base: impl Into<String>,
        identity: impl Into<String>,
        leadership: Arc<Leadership>,
    ) -> Self {
        let (state, _) = watch::channel(ElectionState::Idle);
        Self {
            store,
            base: base.into(),
            identity: identity.into(),
            leadership,
            prepare: None,
            state,
        }
    }

    pub fn with_prepare(mut self, prepare: PrepareTask) -> Self {
        self.prepare = Some(prepare);
        self
    }

    pub fn leader_path(&self) -> String {
        join_path(&self.base, "leader")
    }

    pub fn state(&self) -> ElectionState {
        *self.state.borrow()
    }

    fn transition(&self, next: ElectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(identity = %self.identity, from = ?prev, to = ?next, "election state");
        }
    }

    /// Contend for leadership until `quit` flips to true.
    pub async fn run(&self, task: LeaderTask, mut quit: watch::Receiver<bool>) {
        loop {
            if *quit.borrow() {
                break;
            }
            match self.round(&task, &mut quit).await {
                Ok(Exit::Quit) | Err(Error::Interrupted) => break,
                Ok(Exit::StepDown) => {}
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "election round failed");
                    tokio::select! {
                        _ = tokio::time::sleep(retry_delay()) => {}
                        _ = quit.changed() => {}
                    }
                }
            }
        }
        self.transition(ElectionState::Idle);
    }

    async fn round(&self, task: &LeaderTask, quit: &mut watch::Receiver<bool>) -> Result<Exit> {
        self.transition(ElectionState::AwaitingTurn);
        let mut epoch = self.store.session_epoch();
        epoch.borrow_and_update();

        let mut mutex = DistributedMutex::new(
            self.store.clone(),
            join_path(&self.base, "candidates"),
            self.identity.clone(),
        );
        mutex.lock(None, quit).await?;

        let exit = match self.claim().await {
            Ok(true) => self.lead(task, quit, &mut epoch).await,
            Ok(false) => {
                debug!(identity = %self.identity, "leader node claimed by another candidate");
                Ok(Exit::StepDown)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = mutex.unlock().await {
            debug!(error = %e, "failed to release candidate lock");
        }
        exit
    }

    /// Publish our identity and confirm it stuck.
    async fn claim(&self) -> Result<bool> {
        let path = self.leader_path();
        self.store.ensure_path(&self.base).await?;
        self.store
            .set(&path, self.identity.as_bytes().to_vec(), None)
            .await?;
        let current = self.store.get(&path).await?;
        Ok(current.map(|n| n.data) == Some(self.identity.as_bytes().to_vec()))
    }

    async fn lead(
        &self,
        task: &LeaderTask,
        quit: &mut watch::Receiver<bool>,
        epoch: &mut watch::Receiver<u64>,
    ) -> Result<Exit> {
        if let Some(prepare) = &self.prepare {
            prepare().await?;
        }

        self.transition(ElectionState::Leading);
        info!(identity = %self.identity, "acquired leadership");
        self.leadership.set(true);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut worker: JoinHandle<Result<()>> = tokio::spawn(task(stop_rx));
        let mut worker_done = false;

        let exit = loop {
            let (node, watch) = match self.store.get_watch(&self.leader_path()).await {
                Ok(v) => v,
                Err(e) => break Err(e),
            };
            if node.map(|n| n.data) != Some(self.identity.as_bytes().to_vec()) {
                warn!(identity = %self.identity, "leader node no longer ours");
                break Ok(Exit::StepDown);
            }

            tokio::select! {
                event = watch => {
                    if matches!(event, Ok(WatchEvent::Closed) | Err(_)) {
                        break Ok(Exit::StepDown);
                    }
                }
                _ = epoch.changed() => {
                    warn!(identity = %self.identity, "coordination session expired");
                    break Ok(Exit::StepDown);
                }
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        break Ok(Exit::Quit);
                    }
                }
                result = &mut worker => {
                    worker_done = true;
                    match result {
                        Ok(Ok(())) => debug!("leader task finished"),
                        Ok(Err(e)) => warn!(error = %e, "leader task failed"),
                        Err(e) => warn!(error = %e, "leader task panicked"),
                    }
                    break Ok(Exit::StepDown);
                }
            }
        };

        self.transition(ElectionState::SteppingDown);
        self.leadership.set(false);
        let _ = stop_tx.send(true);
        if !worker_done {
            if let Err(e) = worker.await {
                warn!(error = %e, "leader task panicked");
            }
        }
        if matches!(exit, Ok(Exit::Quit)) {
            // hand over promptly
            let _ = self.store.delete(&self.leader_path()).await;
        }
        info!(identity = %self.identity, "released leadership");
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::coord::memory::{MemorySession, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn idle_task(runs: Arc<AtomicUsize>) -> LeaderTask {
        Box::new(move |mut stop: watch::Receiver<bool>| -> BoxFuture<'static, Result<()>> {
            let runs = runs.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                while !*stop.borrow() {
                    if stop.changed().await.is_err() {
                        break;
                    }
                }
                Ok(())
            })
        })
    }

    struct Candidate {
        session: Arc<MemorySession>,
        leadership: Arc<Leadership>,
        election: Arc<LeaderElection>,
        quit: watch::Sender<bool>,
        handle: JoinHandle<()>,
    }

    fn spawn_candidate(store: &MemoryStore, name: &str, runs: Arc<AtomicUsize>) -> Candidate {
        spawn_prepared(store, name, runs, None)
    }

    fn spawn_prepared(
        store: &MemoryStore,
        name: &str,
        runs: Arc<AtomicUsize>,
        prepare: Option<PrepareTask>,
    ) -> Candidate {
        let session = Arc::new(store.session());
        let leadership = Arc::new(Leadership::new(false));
        let mut election = LeaderElection::new(session.clone(), "/ctl", name, leadership.clone());
        if let Some(prepare) = prepare {
            election = election.with_prepare(prepare);
        }
        let election = Arc::new(election);
        let (quit, quit_rx) = watch::channel(false);
        let runner = election.clone();
        let handle = tokio::spawn(async move { runner.run(idle_task(runs), quit_rx).await });
        Candidate {
            election,
            session,
            leadership,
            quit,
            handle,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fn leaders(candidates: &[Candidate]) -> Vec<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.leadership.is_leader())
            .map(|(i, _)| i)
            .collect()
    }

    #[tokio::test]
    async fn test_exactly_one_leader() {
        let store = MemoryStore::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let candidates: Vec<Candidate> = (0..4)
            .map(|i| spawn_candidate(&store, &format!("node-{}", i), runs.clone()))
            .collect();
        settle().await;

        let leading = leaders(&candidates);
        assert_eq!(leading.len(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        for (i, c) in candidates.iter().enumerate() {
            let expected = if i == leading[0] {
                ElectionState::Leading
            } else {
                ElectionState::AwaitingTurn
            };
            assert_eq!(c.election.state(), expected);
        }

        for c in candidates {
            c.quit.send(true).unwrap();
            c.handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_takeover_after_session_expiry() {
        let store = MemoryStore::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let candidates: Vec<Candidate> = (0..3)
            .map(|i| spawn_candidate(&store, &format!("node-{}", i), runs.clone()))
            .collect();
        settle().await;

        let first = leaders(&candidates);
        assert_eq!(first.len(), 1);
        candidates[first[0]].session.expire();
        settle().await;

        let second = leaders(&candidates);
        assert_eq!(second.len(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let leader = store.session().get("/ctl/leader").await.unwrap().unwrap();
        assert_eq!(leader.data, format!("node-{}", second[0]).into_bytes());

        for c in candidates {
            c.quit.send(true).unwrap();
            c.handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_quit_releases_leadership() {
        let store = MemoryStore::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let c = spawn_candidate(&store, "solo", runs);
        settle().await;
        assert!(c.leadership.is_leader());

        c.quit.send(true).unwrap();
        c.handle.await.unwrap();
        assert!(!c.leadership.is_leader());
        assert_eq!(c.election.state(), ElectionState::Idle);
        assert!(store.session().get("/ctl/leader").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_leader_steps_down_when_leader_node_is_overwritten() {
        let store = MemoryStore::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let c = spawn_candidate(&store, "node-0", runs.clone());
        settle().await;
        assert!(c.leadership.is_leader());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let mut changes = c.leadership.subscribe();
        changes.borrow_and_update();
        store
            .session()
            .set("/ctl/leader", b"intruder".to_vec(), None)
            .await
            .unwrap();

        // steps down, then wins the next round and reclaims the node
        tokio::time::timeout(Duration::from_secs(1), changes.changed())
            .await
            .unwrap()
            .unwrap();
        settle().await;
        assert!(c.leadership.is_leader());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let leader = store.session().get("/ctl/leader").await.unwrap().unwrap();
        assert_eq!(leader.data, b"node-0".to_vec());

        c.quit.send(true).unwrap();
        c.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_runs_before_leadership_is_published() {
        let store = MemoryStore::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let leadership_seen = seen.clone();

        // filled in before the spawned candidate first runs
        let slot: Arc<std::sync::Mutex<Option<Arc<Leadership>>>> = Arc::default();
        let prepare_slot = slot.clone();
        let prepare: PrepareTask = Box::new(move || -> BoxFuture<'static, Result<()>> {
            let seen = leadership_seen.clone();
            let slot = prepare_slot.clone();
            Box::pin(async move {
                let leading = slot.lock().unwrap().as_ref().map(|l| l.is_leader());
                seen.lock().unwrap().push(leading);
                Ok(())
            })
        });

        let runs = Arc::new(AtomicUsize::new(0));
        let c = spawn_prepared(&store, "node-0", runs.clone(), Some(prepare));
        *slot.lock().unwrap() = Some(c.leadership.clone());
        settle().await;

        assert!(c.leadership.is_leader());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Some(false)]);

        c.quit.send(true).unwrap();
        c.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_prepare_keeps_candidate_out_of_office() {
        let store = MemoryStore::new();
        let prepare: PrepareTask = Box::new(|| -> BoxFuture<'static, Result<()>> {
            Box::pin(async { Err(Error::Coordination("store unreadable".into())) })
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let c = spawn_prepared(&store, "node-0", runs.clone(), Some(prepare));
        settle().await;

        assert!(!c.leadership.is_leader());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // the candidate lock is released for others
        assert!(store.session().children("/ctl/candidates").await.unwrap().is_empty());

        c.quit.send(true).unwrap();
        c.handle.await.unwrap();
    }
}
