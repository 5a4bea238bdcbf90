//! Consensus backends.
//!
//! A [`Cluster`] orders registry actions among cooperating controllers and
//! tells each process whether it is the leader. Three variants exist:
//! in-process (single node), raft and a coordination-service election.

pub mod coord;
pub mod local;
pub mod raft;

use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::common::{Broker, Config, Error, Result};
use crate::controller::registry::{Action, MasterRegistry};

pub use coord::CoordCluster;
pub use local::LocalCluster;
pub use raft::RaftCluster;

/// Whether this process leads, plus a channel that observes transitions.
#[derive(Debug)]
pub struct Leadership {
    tx: watch::Sender<bool>,
}

impl Leadership {
    pub fn new(initial: bool) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Update the flag. Subscribers are only woken when it flips.
    pub fn set(&self, leader: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == leader {
                false
            } else {
                *current = leader;
                true
            }
        })
    }

    pub fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Capability set every backend provides.
pub trait Cluster: Send + Sync {
    /// Backend name for status output.
    fn name(&self) -> &'static str;

    /// Commit `action` and apply it to the local registry. On timeout the
    /// outcome is `AmbiguousApply`: the action may still commit.
    fn apply(&self, action: Action, timeout: Duration) -> BoxFuture<'_, Result<()>>;

    /// Wait until every action committed before this call has been applied
    /// locally.
    fn barrier(&self, timeout: Duration) -> BoxFuture<'_, Result<()>>;

    fn is_leader(&self) -> bool;

    /// Address of the current leader, if known.
    fn leader(&self) -> Option<String>;

    /// Leadership flag; `changed()` fires on every transition.
    fn leader_changes(&self) -> watch::Receiver<bool>;

    fn peers(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let name = self.name();
        Box::pin(async move { Err(Error::Other(format!("peer management unsupported by {}", name))) })
    }

    fn add_peer(&self, _addr: String) -> BoxFuture<'_, Result<()>> {
        let name = self.name();
        Box::pin(async move { Err(Error::Other(format!("peer management unsupported by {}", name))) })
    }

    fn remove_peer(&self, _addr: String) -> BoxFuture<'_, Result<()>> {
        let name = self.name();
        Box::pin(async move { Err(Error::Other(format!("peer management unsupported by {}", name))) })
    }

    /// Stop background work and release resources.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Build the backend selected by `config.broker`.
pub async fn build(config: &Config, registry: MasterRegistry) -> Result<Arc<dyn Cluster>> {
    match config.broker {
        Broker::Raft if !config.raft.addr.is_empty() => {
            let cluster = RaftCluster::start(&config.raft, registry).await?;
            Ok(Arc::new(cluster))
        }
        Broker::Coord => {
            let cluster = CoordCluster::start(&config.coord, &config.addr, registry).await?;
            Ok(Arc::new(cluster))
        }
        _ => {
            info!("no consensus backend configured, running as a single node");
            Ok(Arc::new(LocalCluster::new(registry)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_leadership_edges() {
        let leadership = Leadership::new(false);
        let mut rx = leadership.subscribe();

        assert!(!leadership.set(false));
        assert!(!rx.has_changed().unwrap());

        assert!(leadership.set(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(leadership.is_leader());
    }
}
