//! # failoverd
//!
//! A failover controller for master/replica storage groups:
//! - Probes every registered master and promotes a replica when one stays down
//! - Keeps the set of masters consistent across cooperating controllers
//! - Only the elected leader probes and mutates; followers mirror its view
//! - Pluggable consensus: single node, raft (openraft) or an etcd election
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!  │ failoverd #1 │   │ failoverd #2 │   │ failoverd #3 │
//!  │   (leader)   │   │  (follower)  │   │  (follower)  │
//!  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!         └────── raft log / etcd election ─────┘
//!         │ ROLE, INFO REPLICATION, SLAVEOF
//!   ┌─────▼──────┐     ┌────────────┐
//!   │  master A  │ ──▶ │ replica A1 │ ...
//!   └────────────┘     └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! failoverd --addr 127.0.0.1:11000 --masters 127.0.0.1:6379 \
//!   --broker raft --raft-addr 127.0.0.1:12000 \
//!   --raft-cluster 127.0.0.1:12000,127.0.0.1:12001,127.0.0.1:12002
//!
//! failoverctl --server http://127.0.0.1:11000 add 127.0.0.1:6380
//! failoverctl get
//! ```

#![allow(clippy::result_large_err)]

pub mod cluster;
pub mod common;
pub mod controller;
pub mod node;

pub use cluster::Cluster;
pub use common::{Config, Error, Result};
pub use controller::Orchestrator;

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("failoverd");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
