//! Primitives the coordination backend needs from its store: a hierarchical
//! namespace with ephemeral and sequential nodes, versioned values and
//! one-shot watches.

use futures_util::future::BoxFuture;
use tokio::sync::{oneshot, watch};

use crate::common::Result;

/// Width of the zero-padded sequence suffix of sequential nodes.
pub const SEQUENCE_WIDTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a strictly increasing suffix appended to the name.
    EphemeralSequential,
}

/// What fired a one-shot watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    Changed,
    Deleted,
    /// The store went away before anything happened to the node.
    Closed,
}

/// A node's value and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub data: Vec<u8>,
    pub version: i64,
}

pub type Watch = oneshot::Receiver<WatchEvent>;

/// One client session against the coordination service.
pub trait CoordStore: Send + Sync {
    /// Create every missing component of `path` as a persistent node.
    /// Concurrent callers may race; losing the race is not an error.
    fn ensure_path<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Create a node and return its full path. For sequential nodes `path`
    /// is the name prefix and the returned path carries the suffix.
    fn create<'a>(
        &'a self,
        path: &'a str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> BoxFuture<'a, Result<String>>;

    /// Names (not paths) of the direct children of `path`.
    fn children<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<NodeData>>>;

    /// Read a node and watch it for the next change or deletion.
    fn get_watch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(Option<NodeData>, Watch)>>;

    /// Whether a node exists, plus a watch for its next creation, change or
    /// deletion.
    fn exists_watch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(bool, Watch)>>;

    /// Write a persistent value, creating the node if needed. With
    /// `expected_version` the write only succeeds against that version.
    fn set<'a>(
        &'a self,
        path: &'a str,
        data: Vec<u8>,
        expected_version: Option<i64>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Delete a node. Deleting a missing node succeeds.
    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Session epoch; bumped every time the session expired and was
    /// replaced, which means this client's ephemeral nodes are gone.
    fn session_epoch(&self) -> watch::Receiver<u64>;

    /// End the session, dropping its ephemeral nodes.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Last path component.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of `path`, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

/// Sequence number of a sequential node name, e.g. `lock-0000000042` is 42.
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_WIDTH {
        return None;
    }
    name[name.len() - SEQUENCE_WIDTH..].parse().ok()
}

pub fn format_sequence(prefix: &str, seq: u64) -> String {
    format!("{}{:0width$}", prefix, seq, width = SEQUENCE_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(join_path("/", "b"), "/b");
        assert_eq!(base_name("/a/b/lock-0000000001"), "lock-0000000001");
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn test_sequences() {
        let name = format_sequence("lock-", 42);
        assert_eq!(name, "lock-0000000042");
        assert_eq!(sequence_of(&name), Some(42));
        assert_eq!(sequence_of("leader"), None);
    }
}
