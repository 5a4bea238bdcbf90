//! Error types for failoverd

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage node Errors ===
    #[error("Node is down: {0}")]
    NodeDown(String),

    #[error("Node is not the expected type: {0}")]
    NodeType(String),

    #[error("Node may be still alive: {0}")]
    NodeAlive(String),

    #[error("No proper candidate to be promoted to master")]
    NoCandidate,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command error: {0}")]
    Command(String),

    // === Failover Errors ===
    #[error("Give up failover handling")]
    GiveUpFailover,

    // === Consensus Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Apply outcome unknown after {0:?}, the action may or may not be committed")]
    AmbiguousApply(Duration),

    #[error("Lock acquisition timed out: {0}")]
    LockTimeout(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Raft error: {0}")]
    Raft(String),

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Persistence Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that mean the storage node could not be reached or answered
    /// garbage. The node client drops its connection and redials on these.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::ConnectionFailed(_) | Error::Timeout(_)
        )
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::AmbiguousApply(_)
                | Error::NotLeader(_)
                | Error::LockTimeout(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) | Error::AmbiguousApply(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Other(msg) if msg.contains("unsupported") => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        Error::Coordination(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
