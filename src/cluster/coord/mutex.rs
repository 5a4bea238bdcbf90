//! Distributed mutex over sequential ephemeral nodes.
//!
//! Each contender creates `<path>/lock-<seq>`; the lowest sequence holds the
//! lock and every other contender watches only its immediate predecessor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::store::{base_name, join_path, sequence_of, CoordStore, CreateMode};
use crate::common::{Error, Result};

const LOCK_PREFIX: &str = "lock-";

enum Step {
    Create,
    Check,
}

pub struct DistributedMutex {
    store: Arc<dyn CoordStore>,
    path: String,
    identity: String,
    node: Option<String>,
}

impl DistributedMutex {
    pub fn new(store: Arc<dyn CoordStore>, path: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            identity: identity.into(),
            node: None,
        }
    }

    /// Full path of our lock node while we hold or wait for the lock.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Block until the lock is ours, `timeout` elapses, or `interrupt`
    /// flips to true. Our lock node is removed on every failure path.
    pub async fn lock(
        &mut self,
        timeout: Option<Duration>,
        interrupt: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        match self.acquire(deadline, interrupt).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(cleanup) = self.unlock().await {
                    debug!(path = %self.path, error = %cleanup, "failed to remove lock node");
                }
                Err(e)
            }
        }
    }

    async fn acquire(
        &mut self,
        deadline: Option<Instant>,
        interrupt: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut step = Step::Create;
        loop {
            if *interrupt.borrow() {
                return Err(Error::Interrupted);
            }

            match step {
                Step::Create => {
                    self.store.ensure_path(&self.path).await?;
                    let prefix = join_path(&self.path, LOCK_PREFIX);
                    let node = self
                        .store
                        .create(&prefix, self.identity.as_bytes().to_vec(), CreateMode::EphemeralSequential)
                        .await?;
                    debug!(node = %node, "created lock node");
                    self.node = Some(node);
                    step = Step::Check;
                }
                Step::Check => {
                    let own = match &self.node {
                        Some(node) => base_name(node).to_string(),
                        None => {
                            step = Step::Create;
                            continue;
                        }
                    };

                    let mut contenders: Vec<(u64, String)> = self
                        .store
                        .children(&self.path)
                        .await?
                        .into_iter()
                        .filter(|name| name.starts_with(LOCK_PREFIX))
                        .filter_map(|name| sequence_of(&name).map(|seq| (seq, name)))
                        .collect();
                    contenders.sort();

                    let pos = match contenders.iter().position(|(_, name)| *name == own) {
                        Some(pos) => pos,
                        None => {
                            // our node vanished with an expired session
                            debug!(node = %own, "lock node lost, recreating");
                            self.unlock().await?;
                            step = Step::Create;
                            continue;
                        }
                    };
                    if pos == 0 {
                        return Ok(());
                    }

                    let predecessor = join_path(&self.path, &contenders[pos - 1].1);
                    let (exists, watch) = self.store.exists_watch(&predecessor).await?;
                    if !exists {
                        continue;
                    }

                    let expired = async {
                        match deadline {
                            Some(d) => tokio::time::sleep_until(d).await,
                            None => std::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        _ = expired => {
                            return Err(Error::LockTimeout(self.path.clone()));
                        }
                        changed = interrupt.changed() => {
                            if changed.is_err() || *interrupt.borrow() {
                                return Err(Error::Interrupted);
                            }
                        }
                        _ = watch => {}
                    }
                }
            }
        }
    }

    /// Release the lock. Releasing a lock that is not held is a no-op.
    pub async fn unlock(&mut self) -> Result<()> {
        if let Some(node) = self.node.take() {
            self.store.delete(&node).await?;
        }
        Ok(())
    }
}
