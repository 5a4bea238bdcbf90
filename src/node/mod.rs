//! Storage node access: RESP replies, connections and the retrying client.

pub mod client;
pub mod conn;
pub mod reply;

pub use client::{Node, ReplicationInfo, RoleInfo, MAX_ATTEMPTS, ROLE_MASTER, ROLE_REPLICA};
pub use conn::{Connection, Connector, TcpConnector};
pub use reply::Reply;
