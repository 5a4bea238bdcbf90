//! Single-process backend: always leader, actions applied in place.

use futures_util::future::BoxFuture;
use std::time::Duration;
use tokio::sync::watch;

use super::{Cluster, Leadership};
use crate::common::Result;
use crate::controller::registry::{Action, MasterRegistry};

pub struct LocalCluster {
    registry: MasterRegistry,
    leadership: Leadership,
}

impl LocalCluster {
    pub fn new(registry: MasterRegistry) -> Self {
        Self {
            registry,
            leadership: Leadership::new(true),
        }
    }
}

impl Cluster for LocalCluster {
    fn name(&self) -> &'static str {
        "none"
    }

    fn apply(&self, action: Action, _timeout: Duration) -> BoxFuture<'_, Result<()>> {
        self.registry.apply(&action);
        Box::pin(async { Ok(()) })
    }

    fn barrier(&self, _timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    fn leader(&self) -> Option<String> {
        None
    }

    fn leader_changes(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
