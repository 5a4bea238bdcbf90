//! gRPC transport between raft peers.
//!
//! openraft requests and responses travel bincode-encoded inside a single
//! `RaftPayload` message; the service only moves bytes.

use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Raft};
use serde::{de::DeserializeOwned, Serialize};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::debug;

use super::TypeConfig;
use crate::proto::raft_transport_client::RaftTransportClient;
use crate::proto::raft_transport_server::{RaftTransport, RaftTransportServer};
use crate::proto::RaftPayload;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn encode<T: Serialize>(value: &T) -> Result<RaftPayload, Box<bincode::ErrorKind>> {
    Ok(RaftPayload {
        data: bincode::serialize(value)?,
    })
}

fn decode<T: DeserializeOwned>(payload: &RaftPayload) -> Result<T, Box<bincode::ErrorKind>> {
    bincode::deserialize(&payload.data)
}

/// Creates one [`PeerClient`] per target.
#[derive(Debug, Clone, Default)]
pub struct Network;

impl RaftNetworkFactory<TypeConfig> for Network {
    type Network = PeerClient;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> PeerClient {
        PeerClient {
            target,
            addr: node.addr.clone(),
            client: None,
        }
    }
}

/// Lazily connected channel to one peer. The channel is dropped after a
/// transport failure and rebuilt on the next call.
pub struct PeerClient {
    target: u64,
    addr: String,
    client: Option<RaftTransportClient<Channel>>,
}

type RpcResult<T, E = openraft::error::Infallible> =
    Result<T, RPCError<u64, BasicNode, RaftError<u64, E>>>;

impl PeerClient {
    async fn client(&mut self) -> Result<RaftTransportClient<Channel>, tonic::transport::Error> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let channel = Endpoint::from_shared(format!("http://{}", self.addr))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;
        let client = RaftTransportClient::new(channel);
        self.client = Some(client.clone());
        Ok(client)
    }

    /// Send one payload with `send`, returning the decoded remote result.
    async fn call<Req, Resp, E, F, Fut>(&mut self, req: &Req, send: F) -> RpcResult<Resp, E>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
        F: FnOnce(RaftTransportClient<Channel>, RaftPayload) -> Fut,
        Fut: std::future::Future<Output = Result<Response<RaftPayload>, Status>>,
    {
        let payload = encode(req).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        let client = self
            .client()
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;

        let reply = match send(client, payload).await {
            Ok(reply) => reply.into_inner(),
            Err(status) => {
                debug!(peer = %self.addr, error = %status, "raft rpc failed");
                self.client = None;
                return Err(RPCError::Unreachable(Unreachable::new(&status)));
            }
        };

        let result: Result<Resp, RaftError<u64, E>> =
            decode(&reply).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for PeerClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<u64>> {
        self.call(&rpc, |mut c, p| async move { c.append_entries(p).await })
            .await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<u64>, InstallSnapshotError> {
        self.call(&rpc, |mut c, p| async move { c.install_snapshot(p).await })
            .await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> RpcResult<VoteResponse<u64>> {
        self.call(&rpc, |mut c, p| async move { c.vote(p).await }).await
    }
}

/// Inbound side: hands decoded requests to the local raft instance.
pub struct RaftService {
    raft: Raft<TypeConfig>,
}

impl RaftService {
    pub fn new(raft: Raft<TypeConfig>) -> Self {
        Self { raft }
    }

    pub fn into_server(self) -> RaftTransportServer<Self> {
        RaftTransportServer::new(self)
    }
}

fn invalid(e: Box<bincode::ErrorKind>) -> Status {
    Status::invalid_argument(format!("undecodable raft payload: {}", e))
}

fn reply<T: Serialize>(value: &T) -> Result<Response<RaftPayload>, Status> {
    encode(value)
        .map(Response::new)
        .map_err(|e| Status::internal(e.to_string()))
}

#[tonic::async_trait]
impl RaftTransport for RaftService {
    async fn append_entries(
        &self,
        req: Request<RaftPayload>,
    ) -> Result<Response<RaftPayload>, Status> {
        let rpc: AppendEntriesRequest<TypeConfig> = decode(req.get_ref()).map_err(invalid)?;
        reply(&self.raft.append_entries(rpc).await)
    }

    async fn vote(&self, req: Request<RaftPayload>) -> Result<Response<RaftPayload>, Status> {
        let rpc: VoteRequest<u64> = decode(req.get_ref()).map_err(invalid)?;
        reply(&self.raft.vote(rpc).await)
    }

    async fn install_snapshot(
        &self,
        req: Request<RaftPayload>,
    ) -> Result<Response<RaftPayload>, Status> {
        let rpc: InstallSnapshotRequest<TypeConfig> = decode(req.get_ref()).map_err(invalid)?;
        reply(&self.raft.install_snapshot(rpc).await)
    }
}
