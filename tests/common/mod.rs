//! In-memory storage topology answering ROLE, INFO REPLICATION and SLAVEOF.

#![allow(dead_code)]

use bytes::Bytes;
use failoverd::common::{split_host_port, Error, Result};
use failoverd::node::{Connection, Connector, Reply};
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct SimNode {
    /// `None` for masters.
    pub master: Option<String>,
    pub offset: i64,
    pub priority: i64,
    pub link_up: bool,
    pub down: bool,
}

#[derive(Clone, Default)]
pub struct Topology {
    nodes: Arc<Mutex<BTreeMap<String, SimNode>>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_master(&self, addr: &str, offset: i64) {
        self.nodes.lock().unwrap().insert(
            addr.to_string(),
            SimNode {
                master: None,
                offset,
                priority: 100,
                link_up: false,
                down: false,
            },
        );
    }

    pub fn add_replica(&self, addr: &str, master: &str, offset: i64, priority: i64) {
        self.nodes.lock().unwrap().insert(
            addr.to_string(),
            SimNode {
                master: Some(master.to_string()),
                offset,
                priority,
                link_up: true,
                down: false,
            },
        );
    }

    /// Take a master down; its replicas lose their link.
    pub fn kill(&self, addr: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(addr) {
            node.down = true;
        }
        for node in nodes.values_mut() {
            if node.master.as_deref() == Some(addr) {
                node.link_up = false;
            }
        }
    }

    pub fn set_link(&self, addr: &str, up: bool) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(addr) {
            node.link_up = up;
        }
    }

    pub fn node(&self, addr: &str) -> SimNode {
        self.nodes.lock().unwrap()[addr].clone()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    fn execute(&self, addr: &str, cmd: &str, args: &[&str]) -> Result<Reply> {
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.get(addr) {
            Some(node) if !node.down => {}
            _ => return Err(Error::ConnectionFailed(format!("{} is down", addr))),
        }

        match cmd {
            "ROLE" => Ok(role_reply(&nodes, addr)),
            "INFO" => {
                let node = &nodes[addr];
                let text = match &node.master {
                    None => "# Replication\r\nrole:master\r\n".to_string(),
                    Some(_) => format!(
                        "# Replication\r\nrole:slave\r\nmaster_link_status:{}\r\nslave_priority:{}\r\nslave_repl_offset:{}\r\n",
                        if node.link_up { "up" } else { "down" },
                        node.priority,
                        node.offset
                    ),
                };
                Ok(Reply::Bulk(Bytes::from(text)))
            }
            "SLAVEOF" => {
                let target = match args {
                    ["NO", "ONE"] => None,
                    [host, port] => Some(format!("{}:{}", host, port)),
                    _ => return Ok(Reply::Error("ERR wrong number of arguments".into())),
                };
                let link_up = match &target {
                    Some(t) => nodes.get(t).map(|n| !n.down).unwrap_or(false),
                    None => false,
                };
                if let Some(node) = nodes.get_mut(addr) {
                    node.master = target;
                    node.link_up = link_up;
                }
                Ok(Reply::Simple("OK".into()))
            }
            other => Ok(Reply::Error(format!("ERR unknown command {}", other))),
        }
    }
}

fn role_reply(nodes: &BTreeMap<String, SimNode>, addr: &str) -> Reply {
    let node = &nodes[addr];
    match &node.master {
        None => {
            let replicas = nodes
                .iter()
                .filter(|(_, n)| n.master.as_deref() == Some(addr))
                .map(|(a, n)| {
                    let (host, port) = split_host_port(a).unwrap();
                    Reply::Array(vec![
                        Reply::Bulk(Bytes::from(host)),
                        Reply::Bulk(Bytes::from(port.to_string())),
                        Reply::Bulk(Bytes::from(n.offset.to_string())),
                    ])
                })
                .collect();
            Reply::Array(vec![
                Reply::Bulk(Bytes::from_static(b"master")),
                Reply::Integer(node.offset),
                Reply::Array(replicas),
            ])
        }
        Some(master) => {
            let (host, port) = split_host_port(master).unwrap();
            Reply::Array(vec![
                Reply::Bulk(Bytes::from_static(b"slave")),
                Reply::Bulk(Bytes::from(host)),
                Reply::Integer(port as i64),
                Reply::Bulk(Bytes::from_static(b"connected")),
                Reply::Integer(node.offset),
            ])
        }
    }
}

struct SimConnection {
    addr: String,
    topology: Topology,
}

impl Connection for SimConnection {
    fn execute<'a>(&'a mut self, cmd: &'a str, args: &'a [&'a str]) -> BoxFuture<'a, Result<Reply>> {
        let reply = self.topology.execute(&self.addr, cmd, args);
        Box::pin(async move { reply })
    }
}

impl Connector for Topology {
    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
        let up = self
            .nodes
            .lock()
            .unwrap()
            .get(addr)
            .map(|n| !n.down)
            .unwrap_or(false);
        let result: Result<Box<dyn Connection>> = if up {
            Ok(Box::new(SimConnection {
                addr: addr.to_string(),
                topology: self.clone(),
            }))
        } else {
            Err(Error::ConnectionFailed(format!("connection refused: {}", addr)))
        };
        Box::pin(async move { result })
    }
}
