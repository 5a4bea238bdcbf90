//! Connections to storage nodes.
//!
//! `Connector` and `Connection` are the narrow "execute a command, get a
//! typed reply" capability the controller needs. The TCP implementation
//! speaks RESP2; tests plug in scripted connectors instead.

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::reply::{encode_command, parse_reply, Reply};
use crate::common::{Error, Result};

/// Dial and per-command timeout used by the TCP connector.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// An established connection to one storage node.
pub trait Connection: Send {
    /// Send one command and wait for its reply. Error replies are returned
    /// as `Reply::Error`; transport failures as `Err`.
    fn execute<'a>(
        &'a mut self,
        cmd: &'a str,
        args: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Reply>>;
}

/// Dials storage nodes by address.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>>;
}

/// RESP2 over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::Timeout(format!("dial {}", addr)))??;
            stream.set_nodelay(true)?;

            Ok(Box::new(TcpConnection {
                stream,
                read_buf: BytesMut::with_capacity(4096),
                write_buf: BytesMut::with_capacity(256),
                timeout: self.timeout,
            }) as Box<dyn Connection>)
        })
    }
}

/// A TCP connection with read/write buffering.
pub struct TcpConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    timeout: Duration,
}

impl TcpConnection {
    async fn round_trip(&mut self, cmd: &str, args: &[&str]) -> Result<Reply> {
        self.write_buf.clear();
        encode_command(cmd, args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        loop {
            if let Some((reply, consumed)) = parse_reply(&self.read_buf)? {
                let _ = self.read_buf.split_to(consumed);
                return Ok(reply);
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionFailed("server disconnected".into()));
            }
        }
    }
}

impl Connection for TcpConnection {
    fn execute<'a>(
        &'a mut self,
        cmd: &'a str,
        args: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Reply>> {
        Box::pin(async move {
            let timeout = self.timeout;
            tokio::time::timeout(timeout, self.round_trip(cmd, args))
                .await
                .map_err(|_| Error::Timeout(format!("{} after {:?}", cmd, timeout)))?
        })
    }
}
