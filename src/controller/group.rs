//! One master and its replicas: probing, replica election and promotion.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::common::{split_host_port, Error, Result};
use crate::node::{Connector, Node, ROLE_MASTER};

/// Health of a group as seen by the check loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Healthy,
    /// Consecutive failed probes.
    Suspect(u32),
    FailingOver,
    Removed,
}

struct GroupState {
    master: Node,
    replicas: BTreeMap<String, Node>,
    failures: u32,
    status: GroupStatus,
}

/// A master/replica group. Every operation holds the group lock, so at most
/// one probe, election, promotion or close runs at a time per group.
pub struct Group {
    connector: Arc<dyn Connector>,
    state: Mutex<GroupState>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").finish_non_exhaustive()
    }
}

impl Group {
    pub fn new(master: &str, connector: Arc<dyn Connector>) -> Self {
        let state = GroupState {
            master: Node::new(master, connector.clone()),
            replicas: BTreeMap::new(),
            failures: 0,
            status: GroupStatus::Healthy,
        };
        Self {
            connector,
            state: Mutex::new(state),
        }
    }

    pub async fn master_addr(&self) -> String {
        self.state.lock().await.master.addr().to_string()
    }

    pub async fn replica_addrs(&self) -> Vec<String> {
        self.state.lock().await.replicas.keys().cloned().collect()
    }

    pub async fn failures(&self) -> u32 {
        self.state.lock().await.failures
    }

    pub async fn status(&self) -> GroupStatus {
        self.state.lock().await.status
    }

    /// Probe the master with `ROLE`.
    ///
    /// - unreachable: `NodeDown`, failure counter incremented
    /// - not a master: `NodeType`, counter untouched
    /// - master: counter reset and replica map refreshed
    pub async fn check(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let addr = state.master.addr().to_string();

        let role = match state.master.role().await {
            Ok(role) => role,
            Err(e) => {
                state.failures += 1;
                state.status = GroupStatus::Suspect(state.failures);
                debug!(master = %addr, failures = state.failures, error = %e, "probe failed");
                return Err(Error::NodeDown(addr));
            }
        };

        if role.role != ROLE_MASTER {
            return Err(Error::NodeType(format!("{} reports role {}", addr, role.role)));
        }

        state.failures = 0;
        state.status = GroupStatus::Healthy;

        let mut replicas = BTreeMap::new();
        for (replica, _offset) in role.replicas {
            let node = match state.replicas.remove(&replica) {
                Some(node) => node,
                None => {
                    info!(master = %addr, replica = %replica, "replica added");
                    Node::new(replica.clone(), self.connector.clone())
                }
            };
            replicas.insert(replica, node);
        }
        for gone in state.replicas.keys() {
            info!(master = %addr, replica = %gone, "replica removed");
        }
        state.replicas = replicas;

        Ok(())
    }

    /// Whether accumulated downtime reached `max_down_time`. When it has,
    /// the group moves to `FailingOver`.
    pub async fn downtime_exceeded(&self, check_interval: Duration, max_down_time: Duration) -> bool {
        let mut state = self.state.lock().await;
        let downtime = check_interval * state.failures;
        if downtime >= max_down_time {
            state.status = GroupStatus::FailingOver;
            true
        } else {
            false
        }
    }

    /// Pick the replica to promote.
    ///
    /// Replicas that cannot be queried or claim to be masters are skipped.
    /// Any replica whose link to the master is still up aborts the election
    /// with `NodeAlive`. Among the rest the highest `(priority, offset)`
    /// wins; replicas are visited in address order, so ties go to the
    /// smallest address. Priority 0 marks a replica as never eligible.
    pub async fn elect(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        let master = state.master.addr().to_string();
        let mut best: Option<(String, i64, i64)> = None;

        for (addr, node) in state.replicas.iter_mut() {
            let info = match node.replication_info().await {
                Ok(info) => info,
                Err(e) => {
                    warn!(master = %master, replica = %addr, error = %e, "skip replica, replication info failed");
                    continue;
                }
            };

            if info.role == ROLE_MASTER {
                warn!(master = %master, replica = %addr, "skip replica, it is already a master");
                continue;
            }

            if info.link_up() {
                return Err(Error::NodeAlive(format!(
                    "replica {} still has its link to {} up",
                    addr, master
                )));
            }

            if info.priority == 0 {
                debug!(master = %master, replica = %addr, "skip replica with priority 0");
                continue;
            }

            let better = match &best {
                None => true,
                Some((_, priority, offset)) => (info.priority, info.offset) > (*priority, *offset),
            };
            if better {
                best = Some((addr.clone(), info.priority, info.offset));
            }
        }

        best.map(|(addr, _, _)| addr).ok_or(Error::NoCandidate)
    }

    /// Detach `addr` from replication, make it this group's master and point
    /// the remaining replicas at it.
    ///
    /// Re-pointing failures are logged as fatal and do not stop the loop;
    /// the master is replaced either way once the winner is detached.
    pub async fn promote(&self, addr: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let (host, port) = split_host_port(addr)?;
        let mut winner = state
            .replicas
            .remove(addr)
            .ok_or_else(|| Error::Internal(format!("{} is not a replica of this group", addr)))?;

        if let Err(e) = winner.promote().await {
            state.replicas.insert(addr.to_string(), winner);
            return Err(e);
        }

        let old = std::mem::replace(&mut state.master, winner);
        let old_addr = old.addr().to_string();
        drop(old);
        state.failures = 0;
        state.status = GroupStatus::Healthy;

        for (replica, node) in state.replicas.iter_mut() {
            if let Err(e) = node.replicate_of(&host, port).await {
                error!(
                    fatal = true,
                    replica = %replica,
                    new_master = %addr,
                    old_master = %old_addr,
                    error = %e,
                    "failed to point replica at new master"
                );
            }
        }

        info!(old_master = %old_addr, new_master = %addr, "replica promoted");
        Ok(())
    }

    /// Close every connection and mark the group removed.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.master.close();
        for node in state.replicas.values_mut() {
            node.close();
        }
        state.status = GroupStatus::Removed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_downtime_threshold() {
        struct Refuse;
        impl Connector for Refuse {
            fn connect<'a>(
                &'a self,
                addr: &'a str,
            ) -> futures_util::future::BoxFuture<'a, Result<Box<dyn crate::node::Connection>>> {
                Box::pin(async move { Err(Error::ConnectionFailed(addr.to_string())) })
            }
        }

        let group = Group::new("10.0.0.1:6379", Arc::new(Refuse));
        let interval = Duration::from_millis(500);
        let max = Duration::from_secs(1);

        assert!(matches!(group.check().await, Err(Error::NodeDown(_))));
        assert_eq!(group.status().await, GroupStatus::Suspect(1));
        assert!(!group.downtime_exceeded(interval, max).await);

        assert!(matches!(group.check().await, Err(Error::NodeDown(_))));
        assert!(group.downtime_exceeded(interval, max).await);
        assert_eq!(group.status().await, GroupStatus::FailingOver);
    }
}
