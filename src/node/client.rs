//! Bounded-retry client for one storage node.

use std::sync::Arc;
use tracing::debug;

use super::conn::{Connection, Connector};
use super::reply::Reply;
use crate::common::{join_host_port, Error, Result};

/// Attempts per command before the last error is surfaced.
pub const MAX_ATTEMPTS: usize = 3;

pub const ROLE_MASTER: &str = "master";
pub const ROLE_REPLICA: &str = "slave";

/// Parsed `ROLE` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleInfo {
    pub role: String,
    /// Master replication offset; zero for other roles.
    pub offset: i64,
    /// Connected replicas as (`host:port`, offset).
    pub replicas: Vec<(String, i64)>,
}

/// Fields of `INFO REPLICATION` used by replica election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationInfo {
    pub role: String,
    pub master_link_status: Option<String>,
    pub priority: i64,
    pub offset: i64,
}

impl ReplicationInfo {
    pub fn link_up(&self) -> bool {
        self.master_link_status.as_deref() == Some("up")
    }
}

/// One storage endpoint. The connection is dialed lazily and dropped on any
/// transport error.
pub struct Node {
    addr: String,
    connector: Arc<dyn Connector>,
    conn: Option<Box<dyn Connection>>,
    offset: i64,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.addr)
            .field("connected", &self.conn.is_some())
            .field("offset", &self.offset)
            .finish()
    }
}

impl Node {
    pub fn new(addr: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            addr: addr.into(),
            connector,
            conn: None,
            offset: 0,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Last replication offset observed while this node served as master.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Run a command with up to `MAX_ATTEMPTS` attempts.
    ///
    /// Transport errors drop the connection and redial on the next attempt.
    /// An error reply from the node is returned at once as `Error::Command`.
    pub async fn execute(&mut self, cmd: &str, args: &[&str]) -> Result<Reply> {
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if self.conn.is_none() {
                match self.connector.connect(&self.addr).await {
                    Ok(conn) => self.conn = Some(conn),
                    Err(e) => {
                        debug!(addr = %self.addr, attempt, error = %e, "dial failed");
                        last_err = Some(e);
                        continue;
                    }
                }
            }

            let Some(conn) = self.conn.as_mut() else {
                continue;
            };

            match conn.execute(cmd, args).await {
                Ok(Reply::Error(msg)) => return Err(Error::Command(msg)),
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    self.conn = None;
                    if !e.is_connection_error() {
                        return Err(e);
                    }
                    debug!(addr = %self.addr, cmd, attempt, error = %e, "command failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::ConnectionFailed(self.addr.clone())))
    }

    /// Query `ROLE`. For masters the offset is recorded on this node.
    pub async fn role(&mut self) -> Result<RoleInfo> {
        let reply = self.execute("ROLE", &[]).await?;
        let info = parse_role(reply)?;
        if info.role == ROLE_MASTER {
            self.offset = self.offset.max(info.offset);
        }
        Ok(info)
    }

    pub async fn replication_info(&mut self) -> Result<ReplicationInfo> {
        let reply = self.execute("INFO", &["REPLICATION"]).await?;
        let text = reply
            .as_str()
            .ok_or_else(|| Error::Protocol(format!("unexpected INFO reply {:?}", reply)))?;
        Ok(parse_replication_info(text))
    }

    /// Detach from its master (`SLAVEOF NO ONE`).
    pub async fn promote(&mut self) -> Result<()> {
        self.execute("SLAVEOF", &["NO", "ONE"]).await?;
        Ok(())
    }

    /// Replicate from `host:port`.
    pub async fn replicate_of(&mut self, host: &str, port: u16) -> Result<()> {
        let port = port.to_string();
        self.execute("SLAVEOF", &[host, &port]).await?;
        Ok(())
    }

    /// Drop the connection, if any.
    pub fn close(&mut self) {
        self.conn = None;
    }
}

fn parse_role(reply: Reply) -> Result<RoleInfo> {
    let items = reply
        .into_array()
        .ok_or_else(|| Error::Protocol("ROLE reply is not an array".into()))?;

    let role = items
        .first()
        .and_then(Reply::as_str)
        .ok_or_else(|| Error::Protocol("ROLE reply has no role".into()))?
        .to_string();

    if role != ROLE_MASTER {
        return Ok(RoleInfo {
            role,
            offset: 0,
            replicas: Vec::new(),
        });
    }

    let offset = items.get(1).and_then(Reply::as_int).unwrap_or(0);

    let mut replicas = Vec::new();
    if let Some(Reply::Array(list)) = items.get(2) {
        for entry in list {
            let Reply::Array(fields) = entry else {
                return Err(Error::Protocol(format!("bad ROLE replica entry {:?}", entry)));
            };
            let host = fields.first().and_then(Reply::as_str);
            let port = fields.get(1).and_then(Reply::as_int);
            let (Some(host), Some(port)) = (host, port) else {
                return Err(Error::Protocol(format!("bad ROLE replica entry {:?}", fields)));
            };
            let port = u16::try_from(port)
                .map_err(|_| Error::Protocol(format!("bad ROLE replica port {}", port)))?;
            let offset = fields.get(2).and_then(Reply::as_int).unwrap_or(0);
            replicas.push((join_host_port(host, port), offset));
        }
    }

    Ok(RoleInfo {
        role,
        offset,
        replicas,
    })
}

fn parse_replication_info(text: &str) -> ReplicationInfo {
    let mut info = ReplicationInfo {
        role: String::new(),
        master_link_status: None,
        priority: 100,
        offset: 0,
    };

    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        match key {
            "role" => info.role = value.to_string(),
            "master_link_status" => info.master_link_status = Some(value.to_string()),
            "slave_priority" | "replica_priority" => {
                info.priority = value.parse().unwrap_or(info.priority)
            }
            "slave_repl_offset" => info.offset = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Connector that hands out connections replaying a shared script.
    struct Scripted {
        dials: Mutex<usize>,
        script: Arc<Mutex<VecDeque<Result<Reply>>>>,
    }

    struct ScriptedConn {
        script: Arc<Mutex<VecDeque<Result<Reply>>>>,
    }

    impl Connection for ScriptedConn {
        fn execute<'a>(
            &'a mut self,
            _cmd: &'a str,
            _args: &'a [&'a str],
        ) -> BoxFuture<'a, Result<Reply>> {
            let next = self.script.lock().unwrap().pop_front();
            Box::pin(async move { next.unwrap_or_else(|| Err(Error::ConnectionFailed("eof".into()))) })
        }
    }

    impl Connector for Scripted {
        fn connect<'a>(&'a self, _addr: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
            *self.dials.lock().unwrap() += 1;
            let conn = ScriptedConn {
                script: self.script.clone(),
            };
            Box::pin(async move { Ok(Box::new(conn) as Box<dyn Connection>) })
        }
    }

    fn scripted(replies: Vec<Result<Reply>>) -> Arc<Scripted> {
        Arc::new(Scripted {
            dials: Mutex::new(0),
            script: Arc::new(Mutex::new(replies.into())),
        })
    }

    #[tokio::test]
    async fn test_retry_redials_after_connection_error() {
        let connector = scripted(vec![
            Err(Error::ConnectionFailed("reset".into())),
            Ok(Reply::Simple("OK".into())),
        ]);
        let mut node = Node::new("10.0.0.1:6379", connector.clone());

        let reply = node.execute("PING", &[]).await.unwrap();
        assert_eq!(reply, Reply::Simple("OK".into()));
        assert_eq!(*connector.dials.lock().unwrap(), 2);
        assert!(node.is_connected());
    }

    #[tokio::test]
    async fn test_exhausted_attempts_leave_handle_unset() {
        let connector = scripted(vec![
            Err(Error::ConnectionFailed("1".into())),
            Err(Error::ConnectionFailed("2".into())),
            Err(Error::ConnectionFailed("3".into())),
            Ok(Reply::Simple("never".into())),
        ]);
        let mut node = Node::new("10.0.0.1:6379", connector.clone());

        let err = node.execute("PING", &[]).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(ref m) if m == "3"));
        assert!(!node.is_connected());
        assert_eq!(*connector.dials.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_error_reply_is_not_retried() {
        let connector = scripted(vec![
            Ok(Reply::Error("ERR unknown command".into())),
            Ok(Reply::Simple("OK".into())),
        ]);
        let mut node = Node::new("10.0.0.1:6379", connector.clone());

        let err = node.execute("ROLE", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Command(_)));
        assert!(node.is_connected());
    }

    #[tokio::test]
    async fn test_role_records_master_offset() {
        let role = Reply::Array(vec![
            Reply::Bulk(Bytes::from_static(b"master")),
            Reply::Integer(420),
            Reply::Array(vec![Reply::Array(vec![
                Reply::Bulk(Bytes::from_static(b"10.0.0.2")),
                Reply::Bulk(Bytes::from_static(b"6379")),
                Reply::Bulk(Bytes::from_static(b"410")),
            ])]),
        ]);
        let connector = scripted(vec![Ok(role)]);
        let mut node = Node::new("10.0.0.1:6379", connector);

        let info = node.role().await.unwrap();
        assert_eq!(info.role, ROLE_MASTER);
        assert_eq!(info.replicas, vec![("10.0.0.2:6379".to_string(), 410)]);
        assert_eq!(node.offset(), 420);
    }

    #[test]
    fn test_parse_replica_role() {
        let reply = Reply::Array(vec![
            Reply::Bulk(Bytes::from_static(b"slave")),
            Reply::Bulk(Bytes::from_static(b"10.0.0.1")),
            Reply::Integer(6379),
            Reply::Bulk(Bytes::from_static(b"connected")),
            Reply::Integer(100),
        ]);
        let info = parse_role(reply).unwrap();
        assert_eq!(info.role, ROLE_REPLICA);
        assert!(info.replicas.is_empty());
    }

    #[test]
    fn test_parse_role_rejects_out_of_range_port() {
        for port in [b"70000".as_slice(), b"-1".as_slice()] {
            let reply = Reply::Array(vec![
                Reply::Bulk(Bytes::from_static(b"master")),
                Reply::Integer(420),
                Reply::Array(vec![Reply::Array(vec![
                    Reply::Bulk(Bytes::from_static(b"10.0.0.2")),
                    Reply::Bulk(Bytes::copy_from_slice(port)),
                    Reply::Bulk(Bytes::from_static(b"410")),
                ])]),
            ]);
            let err = parse_role(reply).unwrap_err();
            assert!(matches!(err, Error::Protocol(ref m) if m.contains("port")));
        }
    }

    #[test]
    fn test_parse_replication_info() {
        let text = "# Replication\r\nrole:slave\r\nmaster_host:10.0.0.1\r\nmaster_link_status:down\r\nslave_repl_offset:1234\r\nslave_priority:50\r\n";
        let info = parse_replication_info(text);
        assert_eq!(info.role, "slave");
        assert!(!info.link_up());
        assert_eq!(info.priority, 50);
        assert_eq!(info.offset, 1234);

        let info = parse_replication_info("role:master\r\n");
        assert_eq!(info.priority, 100);
        assert_eq!(info.master_link_status, None);
    }
}
