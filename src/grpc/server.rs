use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::client_service::ClientService;
use crate::grpc::cluster_service::ClusterService;
use crate::proto::node_service_server::NodeServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::RaftNode;

pub struct GrpcServer {
    addr: SocketAddr,
    raft_node: Arc<RaftNode>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, raft_node: Arc<RaftNode>) -> Self {
        Self { addr, raft_node }
    }

    /// Serve peer and client RPCs until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let cluster_service = ClusterService::new(self.raft_node.clone());
        let client_service = ClientService::new(self.raft_node.clone());

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(RaftServiceServer::new(cluster_service))
            .add_service(NodeServiceServer::new(client_service))
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await
    }
}
