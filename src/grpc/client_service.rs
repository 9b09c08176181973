use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::error::RaftError;
use crate::proto::node_service_server::NodeService;
use crate::proto::{GetStatusRequest, GetStatusResponse, SubmitRequest, SubmitResponse};
use crate::raft::RaftNode;

/// gRPC service for client-facing API
pub struct ClientService {
    raft_node: Arc<RaftNode>,
}

impl ClientService {
    pub fn new(raft_node: Arc<RaftNode>) -> Self {
        Self { raft_node }
    }
}

#[tonic::async_trait]
impl NodeService for ClientService {
    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitResponse>, Status> {
        if self.raft_node.is_shutdown() {
            return Err(RaftError::Shutdown.into());
        }
        let req = request.into_inner();
        if req.command.is_empty() {
            return Err(Status::invalid_argument("Command must not be empty"));
        }

        let (index, term) = self.raft_node.submit(req.command).await?;
        tracing::info!(index, term, "Accepted client command");
        Ok(Response::new(SubmitResponse { index, term }))
    }

    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let status = self.raft_node.status().await;
        Ok(Response::new(GetStatusResponse {
            node_id: status.node_id,
            role: status.role.to_string(),
            term: status.term,
            has_leader: status.leader_id.is_some(),
            leader_id: status.leader_id.unwrap_or_default(),
            commit_index: status.commit_index,
            last_applied: status.last_applied,
            last_log_index: status.last_log_index,
            snapshot_index: status.snapshot_index,
        }))
    }
}
