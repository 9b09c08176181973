use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tonic::transport::{Channel, Endpoint};

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::transport::RaftTransport;

/// Snapshots can be much larger than log batches
const SNAPSHOT_TIMEOUT_FACTOR: u32 = 10;

/// Peer RPCs over tonic. Channels connect lazily and reconnect on their own,
/// so an unreachable peer only shows up as failed calls.
pub struct GrpcTransport {
    clients: HashMap<u64, RaftServiceClient<Channel>>,
    rpc_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let rpc_timeout = Duration::from_millis(config.rpc_timeout_ms);
        let mut clients = HashMap::new();
        for peer in &config.peers {
            let endpoint = Endpoint::from_shared(format!("http://{}", peer.addr))?
                .connect_timeout(rpc_timeout);
            tracing::debug!(peer_id = peer.node_id, addr = %peer.addr, "Configured peer channel");
            clients.insert(peer.node_id, RaftServiceClient::new(endpoint.connect_lazy()));
        }
        Ok(Self {
            clients,
            rpc_timeout,
        })
    }

    fn client(&self, peer_id: u64) -> Result<RaftServiceClient<Channel>> {
        self.clients
            .get(&peer_id)
            .cloned()
            .ok_or_else(|| RaftError::network(peer_id, "unknown peer"))
    }

    async fn call<T, F>(&self, peer_id: u64, rpc: &str, limit: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        match timeout(limit, fut).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(RaftError::network(
                peer_id,
                format!("{rpc} failed: {}", status.message()),
            )),
            Err(_) => Err(RaftError::network(peer_id, format!("{rpc} timed out"))),
        }
    }
}

#[async_trait]
impl RaftTransport for GrpcTransport {
    async fn request_vote(&self, peer_id: u64, req: VoteRequest) -> Result<VoteResponse> {
        let mut client = self.client(peer_id)?;
        self.call(peer_id, "RequestVote", self.rpc_timeout, client.request_vote(req))
            .await
    }

    async fn append_entries(
        &self,
        peer_id: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut client = self.client(peer_id)?;
        self.call(
            peer_id,
            "AppendEntries",
            self.rpc_timeout,
            client.append_entries(req),
        )
        .await
    }

    async fn install_snapshot(
        &self,
        peer_id: u64,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut client = self.client(peer_id)?;
        self.call(
            peer_id,
            "InstallSnapshot",
            self.rpc_timeout * SNAPSHOT_TIMEOUT_FACTOR,
            client.install_snapshot(req),
        )
        .await
    }
}
