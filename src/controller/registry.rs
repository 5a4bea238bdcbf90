//! Replicated registry of monitored master addresses.
//!
//! The registry is a set mutated only by [`Action`]s, so any two replicas
//! that apply the same actions in the same order hold the same set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::common::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Add,
    Del,
    Set,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Add => write!(f, "add"),
            Command::Del => write!(f, "del"),
            Command::Set => write!(f, "set"),
        }
    }
}

/// Unit of replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub cmd: Command,
    pub masters: Vec<String>,
}

impl Action {
    pub fn new(cmd: Command, masters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            cmd,
            masters: masters.into_iter().map(Into::into).collect(),
        }
    }

    pub fn add(masters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(Command::Add, masters)
    }

    pub fn del(masters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(Command::Del, masters)
    }

    pub fn set(masters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(Command::Set, masters)
    }
}

/// Set of master addresses behind its own lock. Clones share the set; use
/// [`MasterRegistry::copy`] for an independent one.
#[derive(Debug, Clone, Default)]
pub struct MasterRegistry {
    inner: Arc<Mutex<BTreeSet<String>>>,
}

impl MasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn apply(&self, action: &Action) {
        let mut set = self.lock();
        let addrs = action.masters.iter().filter(|m| !m.is_empty());
        match action.cmd {
            Command::Add => set.extend(addrs.cloned()),
            Command::Del => {
                for m in addrs {
                    set.remove(m);
                }
            }
            Command::Set => *set = addrs.cloned().collect(),
        }
    }

    /// Sorted list of masters.
    pub fn masters(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.lock().contains(addr)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// JSON array of the current masters.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let masters = self.masters();
        Ok(serde_json::to_vec(&masters)?)
    }

    /// Replace the set with the one encoded in `data`.
    pub fn restore(&self, data: &[u8]) -> Result<()> {
        let masters: Vec<String> = if data.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(data)?
        };
        self.apply(&Action::set(masters));
        Ok(())
    }

    /// Independent deep copy.
    pub fn copy(&self) -> Self {
        let set = self.lock().clone();
        Self {
            inner: Arc::new(Mutex::new(set)),
        }
    }

    /// Replace this registry's contents with `other`'s.
    pub fn replace_with(&self, other: &MasterRegistry) {
        let set = other.lock().clone();
        *self.lock() = set;
    }
}
